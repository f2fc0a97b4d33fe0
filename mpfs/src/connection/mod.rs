//! Byte transports to the board.
//!
//! All transports expose the same [`Connection`] interface so the REPL
//! driver stays variant agnostic. The concrete flavors are a serial port
//! ([`serial::SerialConnection`]), a telnet session
//! ([`telnet::TelnetConnection`]) and a WebREPL websocket
//! ([`websocket::WebsocketConnection`]). [`fake::FakeBoard`] is a scripted
//! in-memory board used for mocking things in tests and dry runs.

pub mod fake;
pub mod serial;
pub mod telnet;
pub mod websocket;

use std::time::Duration;

/// Poll interval while waiting for a pattern to appear on the wire.
const POLL_PAUSE: Duration = Duration::from_millis(10);

/// An error on the raw byte transport.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    /// The connection could not be opened.
    #[error("Failed to open: {0}")]
    CouldNotOpen(String),
    /// Reading from or writing to the transport failed.
    #[error("I/O on the connection failed")]
    Io(#[from] std::io::Error),
    /// The websocket layer reported a protocol error.
    #[error("The websocket connection failed")]
    Websocket(#[source] Box<tungstenite::Error>),
    /// The remote side did not present the expected prompt during login.
    #[error("The board did not present the expected '{0}' prompt")]
    PromptMissing(&'static str),
    /// The remote side rejected the supplied credentials.
    #[error("Access denied by the board")]
    AccessDenied,
    /// The connection string could not be parsed.
    #[error("'{constr}' is not a valid connection string: {reason}")]
    InvalidConnectString {
        /// The offending connection string.
        constr: String,
        /// Why it was rejected.
        reason: &'static str,
    },
    /// A login-based transport was opened without the required credentials.
    #[error("A {0} connection requires credentials")]
    MissingCredentials(&'static str),
}

impl From<tungstenite::Error> for ConnectionError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => ConnectionError::Io(io),
            other => ConnectionError::Websocket(Box::new(other)),
        }
    }
}

/// A byte-duplex endpoint to the board.
///
/// Implementations are strictly blocking; the driver relies on exactly one
/// operation being in flight at any time.
pub trait Connection: Send {
    /// Read up to `n` bytes. Returns early with what has arrived once the
    /// transport's own read timeout elapses; an empty vector means nothing
    /// arrived at all.
    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError>;

    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> Result<usize, ConnectionError>;

    /// Write all of `data`.
    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Close the transport. Further operations will fail.
    fn close(&mut self) -> Result<(), ConnectionError>;

    /// Drain and return everything currently buffered on the transport.
    fn read_available(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let mut data = Vec::new();
        loop {
            let n = self.bytes_available()?;
            if n == 0 {
                break;
            }
            data.extend(self.read(n)?);
        }
        Ok(data)
    }

    /// Block until the accumulated data ends in `ending`, the line has been
    /// idle for `timeout`, or `max_recv` bytes have been collected.
    ///
    /// Returns whatever was collected; callers decide whether a missing
    /// terminator is an error by checking the suffix themselves.
    fn read_until(
        &mut self,
        min_bytes: usize,
        ending: &[u8],
        timeout: Duration,
        max_recv: usize,
    ) -> Result<Vec<u8>, ConnectionError> {
        let mut data = self.read(min_bytes)?;
        let mut idle = Duration::ZERO;

        while data.len() < max_recv {
            if data.ends_with(ending) {
                break;
            }
            if self.bytes_available()? > 0 {
                data.extend(self.read(1)?);
                idle = Duration::ZERO;
            } else {
                std::thread::sleep(POLL_PAUSE);
                idle += POLL_PAUSE;
                if idle >= timeout {
                    break;
                }
            }
        }

        Ok(data)
    }
}

/// A parsed connection string.
///
/// The accepted forms are
///
/// * `ser:<port>[,<baud>]` (baud defaults to 115200),
/// * `tn:<host>[,<login>[,<passwd>]]`,
/// * `ws:<host>[,<passwd>]`.
///
/// Credentials omitted from the string stay `None`; the caller is expected
/// to prompt for them before opening the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectSpec {
    /// A local serial port.
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
        port: String,
        /// Baud rate.
        baud: u32,
    },
    /// A telnet session, e.g. to a WiPy.
    Telnet {
        /// Host name or address.
        host: String,
        /// Login name, prompted for when absent.
        login: Option<String>,
        /// Password, prompted for when absent.
        password: Option<String>,
    },
    /// A WebREPL websocket.
    Websocket {
        /// Host name or address.
        host: String,
        /// WebREPL password, prompted for when absent.
        password: Option<String>,
    },
}

/// Default baud rate for serial connections.
pub const DEFAULT_BAUD: u32 = 115_200;

impl std::str::FromStr for ConnectSpec {
    type Err = ConnectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ConnectionError::InvalidConnectString {
            constr: s.to_string(),
            reason,
        };

        let (proto, target) = s.split_once(':').ok_or(invalid("missing ':'"))?;
        let mut params = target.split(',').map(str::trim);
        let first = params
            .next()
            .filter(|p| !p.is_empty())
            .ok_or(invalid("missing target"))?;

        match proto.trim() {
            "ser" => {
                let baud = match params.next() {
                    Some(raw) => raw.parse().map_err(|_| invalid("bad baud rate"))?,
                    None => DEFAULT_BAUD,
                };
                Ok(ConnectSpec::Serial {
                    port: first.to_string(),
                    baud,
                })
            }
            "tn" => Ok(ConnectSpec::Telnet {
                host: first.to_string(),
                login: params.next().map(str::to_string),
                password: params.next().map(str::to_string),
            }),
            "ws" => Ok(ConnectSpec::Websocket {
                host: first.to_string(),
                password: params.next().map(str::to_string),
            }),
            _ => Err(invalid("unknown protocol, expected ser:, tn: or ws:")),
        }
    }
}

impl std::fmt::Display for ConnectSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectSpec::Serial { port, baud } => write!(f, "ser:{port},{baud}"),
            ConnectSpec::Telnet { host, .. } => write!(f, "tn:{host}"),
            ConnectSpec::Websocket { host, .. } => write!(f, "ws:{host}"),
        }
    }
}

/// Open the transport described by `spec`.
///
/// `hard_reset` is honored by the serial flavor only, where it pulses the
/// DTR/RTS lines before use.
pub fn open(spec: &ConnectSpec, hard_reset: bool) -> Result<Box<dyn Connection>, ConnectionError> {
    match spec {
        ConnectSpec::Serial { port, baud } => {
            let con = serial::SerialConnection::open(port, *baud, hard_reset)?;
            Ok(Box::new(con))
        }
        ConnectSpec::Telnet {
            host,
            login,
            password,
        } => {
            let login = login
                .as_deref()
                .ok_or(ConnectionError::MissingCredentials("telnet"))?;
            let password = password
                .as_deref()
                .ok_or(ConnectionError::MissingCredentials("telnet"))?;
            let con = telnet::TelnetConnection::open(host, login, password)?;
            Ok(Box::new(con))
        }
        ConnectSpec::Websocket { host, password } => {
            let password = password
                .as_deref()
                .ok_or(ConnectionError::MissingCredentials("webrepl"))?;
            let con = websocket::WebsocketConnection::open(host, password)?;
            Ok(Box::new(con))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_serial_with_default_baud() {
        let spec: ConnectSpec = "ser:/dev/ttyUSB0".parse().unwrap();
        assert_eq!(
            spec,
            ConnectSpec::Serial {
                port: "/dev/ttyUSB0".into(),
                baud: DEFAULT_BAUD,
            }
        );
    }

    #[test]
    fn parses_serial_with_baud() {
        let spec: ConnectSpec = "ser:COM3,9600".parse().unwrap();
        assert_eq!(
            spec,
            ConnectSpec::Serial {
                port: "COM3".into(),
                baud: 9600,
            }
        );
    }

    #[test]
    fn parses_telnet_with_credentials() {
        let spec: ConnectSpec = "tn:192.168.1.101, micro, python".parse().unwrap();
        assert_eq!(
            spec,
            ConnectSpec::Telnet {
                host: "192.168.1.101".into(),
                login: Some("micro".into()),
                password: Some("python".into()),
            }
        );
    }

    #[test]
    fn parses_websocket_without_password() {
        let spec: ConnectSpec = "ws:192.168.1.102".parse().unwrap();
        assert_eq!(
            spec,
            ConnectSpec::Websocket {
                host: "192.168.1.102".into(),
                password: None,
            }
        );
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert!("usb:whatever".parse::<ConnectSpec>().is_err());
        assert!("plainport".parse::<ConnectSpec>().is_err());
        assert!("ser:,9600".parse::<ConnectSpec>().is_err());
    }
}
