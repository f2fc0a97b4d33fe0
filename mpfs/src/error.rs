use crate::board::DriverError;
use crate::connection::ConnectionError;
use crate::fs::RemoteIoError;
use crate::ledger::LedgerParseError;

/// The overarching error type which contains all possible errors as variants.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error on the byte transport to the board occurred.
    #[error("An error with the connection to the board occurred")]
    Connection(#[from] ConnectionError),
    /// The REPL driver lost its protocol with the board.
    ///
    /// Driver errors are transient by nature (a missed prompt, a garbled
    /// acknowledgement, a framing timeout) and are the only errors the
    /// retry policy will retry.
    #[error("An error while driving the board's REPL occurred")]
    Driver(#[from] DriverError),
    /// The board reported a file system error.
    #[error(transparent)]
    Remote(#[from] RemoteIoError),
    /// The digest ledger stored on the board could not be parsed.
    #[error("The digest ledger on the board is corrupt")]
    Ledger(#[from] LedgerParseError),
    /// A file operation on the host side failed.
    #[error("A local file operation failed")]
    Local(#[from] std::io::Error),
    /// The board answers on its command shell but does not run MicroPython.
    #[error("There is no MicroPython on the board")]
    NoMicroPython,
    /// Any other error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether the retry policy is allowed to retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Driver(_))
    }
}
