//! Serial port transport.

use std::io::{Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

use crate::connection::{Connection, ConnectionError};

/// Read timeout of the underlying port. Kept short so callers polling for
/// a prompt see quiet lines quickly; the longer protocol timeouts are
/// enforced by `read_until`.
const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A [`Connection`] over a local serial port.
pub struct SerialConnection {
    port: Box<dyn SerialPort>,
}

impl SerialConnection {
    /// Open `port` at `baud`.
    ///
    /// With `hard_reset` the DTR line is pulsed low before use, which
    /// power-cycles most development boards, and the input buffer is
    /// cleared of the boot chatter afterwards.
    pub fn open(port: &str, baud: u32, hard_reset: bool) -> Result<Self, ConnectionError> {
        let mut port = serialport::new(port, baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?;

        if hard_reset {
            Self::hard_reset(port.as_mut())?;
        }

        Ok(SerialConnection { port })
    }

    fn hard_reset(port: &mut dyn SerialPort) -> Result<(), ConnectionError> {
        port.write_data_terminal_ready(false)
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?;
        std::thread::sleep(Duration::from_millis(100));
        port.write_data_terminal_ready(true)
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?;
        std::thread::sleep(Duration::from_millis(500));
        port.clear(ClearBuffer::Input)
            .map_err(|e| ConnectionError::CouldNotOpen(e.to_string()))?;
        Ok(())
    }
}

impl Connection for SerialConnection {
    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }

        buf.truncate(filled);
        Ok(buf)
    }

    fn bytes_available(&mut self) -> Result<usize, ConnectionError> {
        let n = self
            .port
            .bytes_to_read()
            .map_err(|e| ConnectionError::Io(e.into()))?;
        Ok(n as usize)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        // Dropping the handle closes the port; there is nothing to flush.
        Ok(())
    }
}
