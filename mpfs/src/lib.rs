//! Host-side file and REPL manager for MicroPython-class boards.
//!
//! A board is reached over a byte-oriented transport (serial, telnet or
//! WebREPL websocket) and driven exclusively through its interactive
//! interpreter prompt. This crate turns high level file operations into
//! the interpreter lines that perform them, reads back the framed reply
//! and classifies remote errors.
//!
//! ```no_run
//! use mpfs::connection::ConnectSpec;
//! use mpfs::fs::{FsOps, RemoteFs};
//!
//! # fn main() -> Result<(), mpfs::Error> {
//! let spec: ConnectSpec = "ser:/dev/ttyUSB0,115200".parse()?;
//! let mut fs = RemoteFs::open(&spec, false)?;
//!
//! for entry in fs.ls()? {
//!     println!("{} {}", entry.kind, entry.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! The crate is built around four pieces: the [`connection::Connection`]
//! byte transport, the [`board::Board`] REPL driver on top of it, the
//! [`fs::RemoteFs`] file system façade on top of the driver, and the
//! [`ledger::DigestLedger`] which tracks upload digests on the board
//! itself so unchanged files are never transferred twice.

#![warn(missing_docs)]

pub mod board;
pub mod connection;
pub mod fs;
pub mod ledger;
mod error;
mod retry;

pub use crate::board::{Board, DriverError, ReplMode};
pub use crate::connection::{ConnectSpec, Connection, ConnectionError};
pub use crate::error::Error;
pub use crate::fs::{DirEntry, EntryKind, FsOps, RemoteFs, RemoteIoError};
pub use crate::ledger::DigestLedger;
pub use crate::retry::RetryPolicy;
