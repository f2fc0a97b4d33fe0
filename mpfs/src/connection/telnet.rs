//! Telnet transport, as served by the WiPy and similar boards.
//!
//! The option negotiation is done by hand on the stream: every request is
//! refused, which leaves the session in the plain character mode the REPL
//! needs. No crate in our stack speaks telnet, and the protocol subset
//! required here is four command bytes.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::connection::{Connection, ConnectionError};

const TELNET_PORT: u16 = 23;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

// Telnet command bytes.
const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

/// Parser state for the in-band telnet commands.
#[derive(Clone, Copy, PartialEq, Eq)]
enum IacState {
    Data,
    Command,
    Option(u8),
    Subnegotiation,
    SubnegotiationIac,
}

/// Strips telnet in-band commands from `input`, appending plain data bytes
/// to `data` and the refusals we owe the server to `replies`.
fn filter_iac(state: &mut IacState, input: &[u8], data: &mut VecDeque<u8>, replies: &mut Vec<u8>) {
    for &byte in input {
        *state = match *state {
            IacState::Data if byte == IAC => IacState::Command,
            IacState::Data => {
                data.push_back(byte);
                IacState::Data
            }
            IacState::Command => match byte {
                IAC => {
                    // Escaped literal 0xFF.
                    data.push_back(IAC);
                    IacState::Data
                }
                DO | WILL => IacState::Option(byte),
                DONT | WONT => IacState::Option(byte),
                SB => IacState::Subnegotiation,
                _ => IacState::Data,
            },
            IacState::Option(command) => {
                match command {
                    DO => replies.extend_from_slice(&[IAC, WONT, byte]),
                    WILL => replies.extend_from_slice(&[IAC, DONT, byte]),
                    _ => {}
                }
                IacState::Data
            }
            IacState::Subnegotiation if byte == IAC => IacState::SubnegotiationIac,
            IacState::Subnegotiation => IacState::Subnegotiation,
            IacState::SubnegotiationIac if byte == SE => IacState::Data,
            IacState::SubnegotiationIac => IacState::Subnegotiation,
        };
    }
}

/// A [`Connection`] over a telnet session.
pub struct TelnetConnection {
    stream: TcpStream,
    buffer: VecDeque<u8>,
    iac_state: IacState,
}

impl TelnetConnection {
    /// Connect to `host` and perform the login dialog.
    pub fn open(host: &str, login: &str, password: &str) -> Result<Self, ConnectionError> {
        let addr = (host, TELNET_PORT)
            .to_socket_addrs()
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?
            .next()
            .ok_or_else(|| ConnectionError::CouldNotOpen(format!("cannot resolve {host}")))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?;
        stream.set_read_timeout(Some(POLL_TIMEOUT))?;

        let mut con = TelnetConnection {
            stream,
            buffer: VecDeque::new(),
            iac_state: IacState::Data,
        };

        con.wait_for("login as:", "login")?;
        con.write(login.as_bytes())?;
        con.write(b"\r\n")?;

        con.wait_for("password:", "password")?;
        con.write(password.as_bytes())?;
        con.write(b"\r\n")?;

        con.wait_login_result()?;

        Ok(con)
    }

    /// Pull pending bytes off the socket into the buffer, answering any
    /// telnet negotiation on the way. Returns without blocking longer than
    /// the poll timeout.
    fn fill(&mut self) -> Result<(), ConnectionError> {
        let mut raw = [0u8; 512];
        let mut replies = Vec::new();

        loop {
            match self.stream.read(&mut raw) {
                Ok(0) => break,
                Ok(n) => {
                    filter_iac(&mut self.iac_state, &raw[..n], &mut self.buffer, &mut replies);
                    if n < raw.len() {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !replies.is_empty() {
            self.stream.write_all(&replies)?;
        }

        Ok(())
    }

    fn buffered_text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.iter().copied().collect::<Vec<u8>>()).to_lowercase()
    }

    fn wait_for(&mut self, marker: &str, what: &'static str) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + LOGIN_TIMEOUT;
        loop {
            self.fill()?;
            if self.buffered_text().contains(marker) {
                self.buffer.clear();
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ConnectionError::PromptMissing(what));
            }
            std::thread::sleep(POLL_TIMEOUT);
        }
    }

    fn wait_login_result(&mut self) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + LOGIN_TIMEOUT;
        loop {
            self.fill()?;
            let text = self.buffered_text();
            if text.contains("login succeeded") {
                self.buffer.clear();
                return Ok(());
            }
            if text.contains("login failed") || text.contains("invalid credentials") {
                return Err(ConnectionError::AccessDenied);
            }
            if Instant::now() >= deadline {
                return Err(ConnectionError::PromptMissing("login result"));
            }
            std::thread::sleep(POLL_TIMEOUT);
        }
    }
}

impl Connection for TelnetConnection {
    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let deadline = Instant::now() + READ_TIMEOUT;
        while self.buffer.len() < n && Instant::now() < deadline {
            self.fill()?;
            if self.buffer.len() >= n {
                break;
            }
            std::thread::sleep(POLL_TIMEOUT);
        }

        let take = n.min(self.buffer.len());
        Ok(self.buffer.drain(..take).collect())
    }

    fn bytes_available(&mut self) -> Result<usize, ConnectionError> {
        self.fill()?;
        Ok(self.buffer.len())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        // A literal 0xFF in the payload must be doubled on the wire.
        if data.contains(&IAC) {
            let mut escaped = Vec::with_capacity(data.len() + 4);
            for &b in data {
                escaped.push(b);
                if b == IAC {
                    escaped.push(IAC);
                }
            }
            self.stream.write_all(&escaped)?;
        } else {
            self.stream.write_all(data)?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn passes_plain_data_through() {
        let mut state = IacState::Data;
        let mut data = VecDeque::new();
        let mut replies = Vec::new();

        filter_iac(&mut state, b"hello >>>", &mut data, &mut replies);

        assert_eq!(data.into_iter().collect::<Vec<u8>>(), b"hello >>>");
        assert!(replies.is_empty());
    }

    #[test]
    fn refuses_negotiation_requests() {
        let mut state = IacState::Data;
        let mut data = VecDeque::new();
        let mut replies = Vec::new();

        // DO ECHO(1), WILL SGA(3), with payload around them.
        filter_iac(
            &mut state,
            &[b'a', IAC, DO, 1, b'b', IAC, WILL, 3, b'c'],
            &mut data,
            &mut replies,
        );

        assert_eq!(data.into_iter().collect::<Vec<u8>>(), b"abc");
        assert_eq!(replies, vec![IAC, WONT, 1, IAC, DONT, 3]);
    }

    #[test]
    fn unescapes_literal_ff_and_skips_subnegotiation() {
        let mut state = IacState::Data;
        let mut data = VecDeque::new();
        let mut replies = Vec::new();

        filter_iac(
            &mut state,
            &[IAC, IAC, IAC, SB, 31, 0, 80, IAC, SE, b'x'],
            &mut data,
            &mut replies,
        );

        assert_eq!(data.into_iter().collect::<Vec<u8>>(), &[IAC, b'x']);
        assert!(replies.is_empty());
    }

    #[test]
    fn command_split_across_reads_is_still_handled() {
        let mut state = IacState::Data;
        let mut data = VecDeque::new();
        let mut replies = Vec::new();

        filter_iac(&mut state, &[IAC], &mut data, &mut replies);
        filter_iac(&mut state, &[DO], &mut data, &mut replies);
        filter_iac(&mut state, &[1, b'z'], &mut data, &mut replies);

        assert_eq!(data.into_iter().collect::<Vec<u8>>(), b"z");
        assert_eq!(replies, vec![IAC, WONT, 1]);
    }
}
