mod shell;
mod state;
mod term;
mod util;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use crate::shell::{run_interactive, ShellCli, ShellData, ShellState};
use crate::util::logging::{setup_logging, LevelFilter};

#[derive(clap::Parser)]
#[clap(
    name = "mpfs",
    about = "A file shell for MicroPython boards",
    version
)]
struct Cli {
    /// Execute the given commands (separated by ';') instead of reading
    /// them interactively
    #[clap(short = 'c', long, num_args = 1.., value_name = "COMMAND")]
    command: Option<Vec<String>>,

    /// Execute commands from a script file ('#' starts a comment line)
    #[clap(short = 's', long, value_name = "FILE")]
    script: Option<PathBuf>,

    /// Do not enter the interactive shell
    #[clap(short = 'n', long)]
    noninteractive: bool,

    /// Disable the remote listing cache
    #[clap(long)]
    nocache: bool,

    /// Hard reset the board via DTR on connect (serial connections only)
    #[clap(long)]
    reset: bool,

    /// Write probe logs to this file
    #[clap(long, value_name = "FILE", help_heading = "LOG CONFIGURATION")]
    log_file: Option<PathBuf>,

    /// Log level for stderr output
    #[clap(long, value_name = "LEVEL", help_heading = "LOG CONFIGURATION")]
    log_level: Option<LevelFilter>,

    /// Directly open the given board
    #[clap(short = 'o', long, value_name = "BOARD")]
    open: Option<String>,

    /// Directly open the given board
    board: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = match setup_logging(cli.log_file.as_deref(), cli.log_level) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to set up logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shell_cli = ShellCli::new();
    let mut data = ShellData::new(!cli.nocache, cli.reset);

    // A positional board wins over --open.
    let board = match (&cli.board, &cli.open) {
        (Some(positional), Some(_)) => {
            println!("Positional argument ({positional}) takes precedence over --open.");
            Some(positional.clone())
        }
        (Some(positional), None) => Some(positional.clone()),
        (None, flag) => flag.clone(),
    };
    if let Some(board) = board {
        shell_cli.handle_line(&mut data, &format!("open {board}"));
    }

    if let Some(commands) = &cli.command {
        for command in commands.join(" ").split(';') {
            if shell_cli.handle_line(&mut data, command) == ShellState::Stop {
                break;
            }
        }
    } else if let Some(script) = &cli.script {
        match std::fs::read_to_string(script) {
            Ok(content) => {
                for line in content.lines() {
                    if shell_cli.handle_line(&mut data, line) == ShellState::Stop {
                        break;
                    }
                }
            }
            Err(e) => {
                eprintln!("cannot read script {}: {e}", script.display());
                return ExitCode::FAILURE;
            }
        }
    }

    if !cli.noninteractive && cli.command.is_none() && cli.script.is_none() {
        if let Err(e) = run_interactive(&shell_cli, &mut data) {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    data.disconnect();
    if data.had_error {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
