//! Interactive REPL passthrough.
//!
//! For its duration the driver surrenders the connection: keystrokes go
//! to the board verbatim, board output goes to the terminal verbatim. The
//! caller tears the raw REPL session down before and re-attaches after.

use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

use mpfs::Connection;

const POLL: Duration = Duration::from_millis(10);

/// Exit character: Ctrl+].
const EXIT_CHAR: char = ']';

/// Run the passthrough until the user presses Ctrl+].
pub fn run(con: &mut dyn Connection, initial: Option<&str>) -> anyhow::Result<()> {
    println!("\n*** Exit REPL with Ctrl+] ***");

    enable_raw_mode().context("failed to enable raw terminal mode")?;
    let result = passthrough(con, initial);
    let _ = disable_raw_mode();
    println!();

    result
}

fn passthrough(con: &mut dyn Connection, initial: Option<&str>) -> anyhow::Result<()> {
    if let Some(chars) = initial {
        con.write(chars.as_bytes())?;
    }

    let mut stdout = std::io::stdout();

    loop {
        let data = con.read_available()?;
        if !data.is_empty() {
            stdout.write_all(&data)?;
            stdout.flush()?;
        }

        if !event::poll(POLL)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind == KeyEventKind::Release {
            continue;
        }

        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        if ctrl && key.code == KeyCode::Char(EXIT_CHAR) {
            return Ok(());
        }

        let bytes: Vec<u8> = match key.code {
            KeyCode::Char(c) if ctrl => {
                let upper = c.to_ascii_uppercase();
                if upper.is_ascii_alphabetic() || ('@'..='_').contains(&upper) {
                    vec![(upper as u8) & 0x1f]
                } else {
                    continue;
                }
            }
            KeyCode::Char(c) => c.to_string().into_bytes(),
            KeyCode::Enter => b"\r".to_vec(),
            KeyCode::Backspace => vec![0x7f],
            KeyCode::Tab => b"\t".to_vec(),
            KeyCode::Esc => vec![0x1b],
            KeyCode::Up => b"\x1b[A".to_vec(),
            KeyCode::Down => b"\x1b[B".to_vec(),
            KeyCode::Right => b"\x1b[C".to_vec(),
            KeyCode::Left => b"\x1b[D".to_vec(),
            KeyCode::Home => b"\x1b[H".to_vec(),
            KeyCode::End => b"\x1b[F".to_vec(),
            KeyCode::Delete => b"\x1b[3~".to_vec(),
            _ => continue,
        };

        con.write(&bytes)?;
    }
}
