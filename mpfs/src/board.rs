//! The REPL driver.
//!
//! Owns the [`Connection`] and moves the board between its three
//! interaction modes: the friendly `>>>` prompt, the raw REPL used for
//! framed command execution, and the auxiliary command shell. All file
//! system traffic of the crate funnels through [`Board::exec`] /
//! [`Board::eval`].

use std::time::Duration;

use regex::Regex;

use crate::connection::{Connection, ConnectionError};
use crate::error::Error;

/// Commands are written in slices this small because USB-serial bridges
/// and the smaller chips have tiny receive buffers.
const WRITE_SLICE: usize = 32;

/// Rounds of the interrupt/soft-reboot volley tried before giving up on
/// reaching the friendly prompt.
const RESET_ROUNDS: usize = 8;

/// Cap on a single banner read.
const BANNER_MAX: usize = 8000;

const CTRL_A: u8 = 0x01;
const CTRL_B: u8 = 0x02;
const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;

const RAW_BANNER: &[u8] = b"raw REPL; CTRL-B to exit";
const FRIENDLY_PROMPT: &[u8] = b">>>";
const NO_MPY_MARKER: &[u8] = b"mpy: command not found";

/// Interaction modes of the remote interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplMode {
    /// The line oriented `>>>` prompt.
    Friendly,
    /// The framed raw REPL.
    Raw,
    /// The auxiliary command shell.
    Shell,
}

/// Errors raised while driving the board's REPL.
///
/// These are the transient protocol failures (a lost prompt, a garbled
/// acknowledgement, a framing timeout) plus [`DriverError::Interpreter`]
/// for commands the board accepted but that raised on the remote side.
#[derive(thiserror::Error, Debug)]
pub enum DriverError {
    /// I/O on the underlying transport failed.
    #[error("I/O on the connection failed")]
    Connection(#[from] ConnectionError),
    /// The friendly prompt never appeared, so the raw REPL could not be
    /// entered.
    #[error("could not enter raw repl")]
    RawReplEntry,
    /// The raw prompt was not where it should have been.
    #[error("could not enter raw repl, auto try again")]
    PromptLost,
    /// The board did not acknowledge a framed command with `OK`.
    #[error("could not exec command, auto try again")]
    CommandRejected(Vec<u8>),
    /// An output segment did not terminate within the follow timeout.
    #[error("timeout waiting for {0} EOF reception")]
    EofTimeout(&'static str),
    /// The board acknowledged a command but replied with something the
    /// caller cannot make sense of.
    #[error("unexpected reply from the board: {0}")]
    UnexpectedReply(String),
    /// The command ran and raised on the board.
    #[error("exception on the board: {}", String::from_utf8_lossy(.error).trim())]
    Interpreter {
        /// Bytes of the normal output segment.
        output: Vec<u8>,
        /// Bytes of the error output segment (the traceback).
        error: Vec<u8>,
    },
}

/// Protocol pauses and timeouts of the driver.
///
/// The defaults match what real boards need; tests against a scripted
/// board shrink them to keep the suite fast.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Wait for the raw prompt before a command.
    pub prompt: Duration,
    /// Wait for each `\x04` terminated output segment.
    pub follow: Duration,
    /// Wait for the friendly banner during reset volleys.
    pub banner: Duration,
    /// Pause between the bytes of a reset volley.
    pub reset_pause: Duration,
    /// Pause between 32-byte command slices.
    pub slice_pause: Duration,
    /// Pause around shell mode transitions.
    pub shell_pause: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            prompt: Duration::from_secs(10),
            follow: Duration::from_secs(4),
            banner: Duration::from_secs(5),
            reset_pause: Duration::from_millis(100),
            slice_pause: Duration::from_millis(10),
            shell_pause: Duration::from_millis(500),
        }
    }
}

impl Timeouts {
    /// Near-zero pauses for driving a scripted board in tests.
    pub fn fast() -> Self {
        Timeouts {
            prompt: Duration::from_millis(50),
            follow: Duration::from_millis(50),
            banner: Duration::from_millis(30),
            reset_pause: Duration::from_millis(1),
            slice_pause: Duration::ZERO,
            shell_pause: Duration::from_millis(1),
        }
    }
}

/// The REPL driver for one board.
pub struct Board {
    con: Box<dyn Connection>,
    mode: ReplMode,
    model: Option<String>,
    timeouts: Timeouts,
}

impl Board {
    /// Wrap a freshly opened connection. The board is assumed to sit at
    /// (or reach, after a reset volley) its friendly prompt.
    pub fn new(con: Box<dyn Connection>) -> Self {
        Board {
            con,
            mode: ReplMode::Friendly,
            model: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Replace the protocol timeouts.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    /// The driver's view of the board's current mode.
    pub fn mode(&self) -> ReplMode {
        self.mode
    }

    /// The board model extracted from the banner, if any was detected.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Direct access to the transport.
    ///
    /// Used by the interactive passthrough, which takes the connection
    /// over wholesale for its duration. The caller is responsible for
    /// re-establishing a known mode afterwards.
    pub fn connection_mut(&mut self) -> &mut dyn Connection {
        &mut *self.con
    }

    /// Write one volley of interrupts and soft reboots, which lands any
    /// non-wedged board back at its friendly prompt.
    fn reset_volley(&mut self) -> Result<(), DriverError> {
        std::thread::sleep(self.timeouts.reset_pause);
        self.con.write(&[CTRL_C; 4])?;
        std::thread::sleep(self.timeouts.reset_pause);
        self.con.write(&[CTRL_B; 4])?;
        std::thread::sleep(self.timeouts.reset_pause);
        Ok(())
    }

    /// Read the friendly banner and extract the board model.
    ///
    /// Returns the model string when the banner carries one of the known
    /// `... board with <model>` markers. A board whose shell answers
    /// `mpy: command not found` has no MicroPython at all, which is fatal.
    pub fn detect_model(&mut self) -> Result<Option<String>, Error> {
        let mut banner = Vec::new();

        for round in 0..RESET_ROUNDS {
            self.reset_volley().map_err(Error::Driver)?;

            let data = self
                .con
                .read_until(1, FRIENDLY_PROMPT, self.timeouts.banner, BANNER_MAX)
                .map_err(|e| Error::Driver(e.into()))?;

            let no_mpy = data
                .windows(NO_MPY_MARKER.len())
                .any(|w| w == NO_MPY_MARKER);
            if no_mpy {
                return Err(Error::NoMicroPython);
            }

            banner.extend_from_slice(&data);
            if data.ends_with(FRIENDLY_PROMPT) {
                break;
            }
            tracing::warn!("no friendly prompt after reset volley {}", round + 1);
        }

        // Later volleys queue extra copies of the banner; collect the
        // residue as well before matching, it usually holds the model line.
        banner.extend(self.con.read_available().map_err(DriverError::from)?);

        let text = String::from_utf8_lossy(&banner);
        let model = [r"MicroPython board with (\w+)", r"ESP module with (\w+)"]
            .iter()
            .find_map(|pat| {
                Regex::new(pat)
                    .expect("static pattern")
                    .captures(&text)
                    .map(|c| c[1].to_string())
            });

        tracing::info!(?model, "board detection finished");
        self.model = model.clone();
        Ok(model)
    }

    /// Move the board to the raw REPL, resetting it to the friendly prompt
    /// first.
    pub fn enter_raw_repl(&mut self) -> Result<(), DriverError> {
        for round in 0..RESET_ROUNDS {
            self.reset_volley()?;

            let data = self
                .con
                .read_until(1, FRIENDLY_PROMPT, self.timeouts.banner, BANNER_MAX)?;
            if data.ends_with(FRIENDLY_PROMPT) {
                break;
            }
            tracing::warn!("no friendly prompt after reset volley {}", round + 1);
        }
        self.mode = ReplMode::Friendly;

        // Flush whatever the volleys left behind.
        while self.con.bytes_available()? > 0 {
            self.con.read_available()?;
        }

        self.con.write(b"\r")?;
        self.con.write(&[CTRL_A])?;
        let data = self
            .con
            .read_until(1, RAW_BANNER, self.timeouts.prompt, BANNER_MAX)?;
        if !data.ends_with(RAW_BANNER) {
            return Err(DriverError::RawReplEntry);
        }

        self.mode = ReplMode::Raw;
        Ok(())
    }

    /// Drop back to the friendly prompt.
    pub fn exit_raw_repl(&mut self) -> Result<(), DriverError> {
        self.con.write(b"\r")?;
        self.con.write(&[CTRL_B])?;
        self.mode = ReplMode::Friendly;
        Ok(())
    }

    /// Interrupt whatever the board is running.
    pub fn keyboard_interrupt(&mut self) -> Result<(), DriverError> {
        self.con.write(&[CTRL_C; 4])?;
        Ok(())
    }

    /// Read the two `\x04` terminated output segments of a framed command.
    fn follow(&mut self, timeout: Duration) -> Result<(Vec<u8>, Vec<u8>), DriverError> {
        let mut output = self
            .con
            .read_until(1, &[CTRL_D], timeout, usize::MAX)?;
        if !output.ends_with(&[CTRL_D]) && !output.ends_with(b">") {
            return Err(DriverError::EofTimeout("first"));
        }
        output.pop();

        let mut error = self
            .con
            .read_until(1, &[CTRL_D], timeout, usize::MAX)?;
        if !error.ends_with(&[CTRL_D]) && !error.ends_with(b">") {
            return Err(DriverError::EofTimeout("second"));
        }
        error.pop();

        Ok((output, error))
    }

    /// Frame and send `command` without reading its output.
    pub fn exec_raw_no_follow(&mut self, command: &str) -> Result<(), DriverError> {
        tracing::debug!(command, "exec");

        let data = self
            .con
            .read_until(1, b">", self.timeouts.prompt, usize::MAX)?;
        if !data.ends_with(b">") {
            return Err(DriverError::PromptLost);
        }

        for slice in command.as_bytes().chunks(WRITE_SLICE) {
            self.con.write(slice)?;
            std::thread::sleep(self.timeouts.slice_pause);
        }
        self.con.write(&[CTRL_D])?;

        let ack = self.con.read(2)?;
        if ack != b"OK" {
            let mut seen = ack;
            seen.extend(self.con.read_available()?);
            tracing::error!(ack = ?String::from_utf8_lossy(&seen), "command not acknowledged");
            return Err(DriverError::CommandRejected(seen));
        }

        Ok(())
    }

    /// Run a garbage collection on the board, fire and forget. Its framing
    /// reply is consumed by the prompt wait of the next command.
    fn collect_garbage(&mut self) -> Result<(), DriverError> {
        let data = self
            .con
            .read_until(1, b">", self.timeouts.prompt, usize::MAX)?;
        if !data.ends_with(b">") {
            return Err(DriverError::PromptLost);
        }

        for slice in b"gc.collect()".chunks(WRITE_SLICE) {
            self.con.write(slice)?;
            std::thread::sleep(self.timeouts.slice_pause);
        }
        self.con.write(&[CTRL_D])?;
        Ok(())
    }

    /// Frame `command`, wait for both output segments.
    pub fn exec_raw(
        &mut self,
        command: &str,
        timeout: Duration,
        gc: bool,
    ) -> Result<(Vec<u8>, Vec<u8>), DriverError> {
        if gc {
            self.collect_garbage()?;
        }
        self.exec_raw_no_follow(command)?;
        self.follow(timeout)
    }

    /// Execute `command`; a non-empty error segment becomes
    /// [`DriverError::Interpreter`].
    pub fn exec(&mut self, command: &str) -> Result<Vec<u8>, DriverError> {
        self.exec_with_timeout(command, self.timeouts.follow)
    }

    /// [`Board::exec`] with an explicit follow timeout; interactive
    /// callers opt into the short 1 s window with this.
    pub fn exec_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, DriverError> {
        let (output, error) = self.exec_raw(command, timeout, false)?;
        if !error.is_empty() {
            return Err(DriverError::Interpreter { output, error });
        }
        Ok(output)
    }

    /// Evaluate a single expression and return its printed rendering,
    /// trimmed.
    ///
    /// The `uos.system` family prints a success status which must not leak
    /// into the payload, so for any expression mentioning `uos` the
    /// `\r\n0` status tail is stripped from the result.
    pub fn eval(&mut self, expression: &str) -> Result<String, DriverError> {
        let output = self.exec(&format!("print({expression})"))?;
        let mut text = String::from_utf8_lossy(&output).into_owned();
        if expression.contains("uos") {
            text = text.replace("\r\n0", "");
        }
        Ok(text.trim().to_string())
    }

    /// Leave the raw REPL for the auxiliary command shell.
    fn enter_shell(&mut self) -> Result<(), DriverError> {
        self.con.write(&[CTRL_D])?;
        std::thread::sleep(self.timeouts.shell_pause);
        self.mode = ReplMode::Shell;
        Ok(())
    }

    /// Return from the shell to the raw REPL.
    fn exit_shell(&mut self) -> Result<(), DriverError> {
        self.con.write(b"mpy\r\n")?;
        self.con.write(b"\r")?;
        self.con.write(&[CTRL_C])?;
        self.con.write(b"\r\n")?;
        self.con.write(b"\r")?;
        self.con.write(&[CTRL_B])?;
        self.con.write(b"\r\n")?;
        self.mode = ReplMode::Raw;
        Ok(())
    }

    /// Run one command in the auxiliary shell and return its raw output.
    ///
    /// The board usually needs a full re-setup afterwards; the shell's
    /// `mpy` runs leave the interpreter freshly booted.
    pub fn exec_command_in_shell(&mut self, command: &str) -> Result<Vec<u8>, DriverError> {
        self.enter_shell()?;

        self.con.write(command.as_bytes())?;
        self.con.write(b"\r\n")?;
        std::thread::sleep(self.timeouts.shell_pause);

        let mut data = Vec::new();
        while self.con.bytes_available()? > 0 {
            data.extend(self.con.read_available()?);
        }

        self.exit_shell()?;
        Ok(data)
    }

    /// Leave the raw REPL and close the transport.
    pub fn close(&mut self) -> Result<(), DriverError> {
        if self.mode == ReplMode::Raw {
            let _ = self.exit_raw_repl();
        }
        self.con.close()?;
        Ok(())
    }
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("mode", &self.mode)
            .field("model", &self.model)
            .finish()
    }
}
