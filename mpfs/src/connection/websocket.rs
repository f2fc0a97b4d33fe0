//! WebREPL websocket transport.

use std::collections::VecDeque;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tungstenite::{Message, WebSocket};

use crate::connection::{Connection, ConnectionError};

const WEBREPL_PORT: u16 = 8266;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_TIMEOUT: Duration = Duration::from_millis(10);
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A [`Connection`] over the WebREPL websocket served on port 8266.
pub struct WebsocketConnection {
    socket: WebSocket<TcpStream>,
    buffer: VecDeque<u8>,
}

impl WebsocketConnection {
    /// Connect to `host` and unlock the session with the WebREPL password.
    pub fn open(host: &str, password: &str) -> Result<Self, ConnectionError> {
        let addr = (host, WEBREPL_PORT)
            .to_socket_addrs()
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?
            .next()
            .ok_or_else(|| ConnectionError::CouldNotOpen(format!("cannot resolve {host}")))?;

        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?;

        // The handshake runs on the still-blocking stream; the short poll
        // timeout is installed afterwards for the data phase.
        let (socket, _response) = tungstenite::client(format!("ws://{host}:{WEBREPL_PORT}/"), stream)
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?;
        socket
            .get_ref()
            .set_read_timeout(Some(POLL_TIMEOUT))
            .map_err(ConnectionError::Io)?;

        let mut con = WebsocketConnection {
            socket,
            buffer: VecDeque::new(),
        };

        con.wait_for("Password:")?;
        con.write(password.as_bytes())?;
        con.write(b"\r\n")?;
        con.wait_for("WebREPL connected")?;

        Ok(con)
    }

    /// Pull any pending frames into the byte buffer without blocking longer
    /// than the poll timeout.
    fn fill(&mut self) -> Result<(), ConnectionError> {
        loop {
            match self.socket.read() {
                Ok(Message::Text(text)) => self.buffer.extend(text.as_bytes()),
                Ok(Message::Binary(data)) => self.buffer.extend(data),
                // Control frames are answered by tungstenite itself.
                Ok(_) => {}
                Err(tungstenite::Error::Io(e))
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Ok(());
                }
                Err(tungstenite::Error::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wait_for(&mut self, marker: &str) -> Result<(), ConnectionError> {
        let deadline = Instant::now() + LOGIN_TIMEOUT;
        loop {
            self.fill()?;
            let text =
                String::from_utf8_lossy(&self.buffer.iter().copied().collect::<Vec<u8>>())
                    .into_owned();
            if text.contains(marker) {
                self.buffer.clear();
                return Ok(());
            }
            if text.to_lowercase().contains("access denied") {
                return Err(ConnectionError::AccessDenied);
            }
            if Instant::now() >= deadline {
                return Err(ConnectionError::PromptMissing("webrepl"));
            }
            std::thread::sleep(POLL_TIMEOUT);
        }
    }
}

impl Connection for WebsocketConnection {
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
        // The WebREPL terminal channel is text based; everything the driver
        // sends is ASCII (interpreter source plus control bytes).
        let text = String::from_utf8_lossy(data).into_owned();
        self.socket.send(Message::Text(text))?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        let _ = self.socket.close(None);
        Ok(())
    }
}
