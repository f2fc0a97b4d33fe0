//! The interactive file shell.
//!
//! Commands live in a table and dispatch on the first word of the line;
//! everything after the verb is handed to the command as its argument
//! string. The shell owns at most one connected façade at a time.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context};
use colored::Colorize;

use mpfs::connection::ConnectSpec;
use mpfs::fs::cache::CachedFs;
use mpfs::fs::{EntryKind, ExecTool, FsOps, PutOutcome, RemoteFs};

use crate::state::{self, SessionState};
use crate::term;

/// Whether the shell keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Continue,
    Stop,
}

pub struct ShellData {
    pub fe: Option<Box<dyn FsOps>>,
    pub caching: bool,
    pub hard_reset: bool,
    pub open_args: Option<String>,
    pub had_error: bool,
}

impl ShellData {
    pub fn new(caching: bool, hard_reset: bool) -> Self {
        ShellData {
            fe: None,
            caching,
            hard_reset,
            open_args: None,
            had_error: false,
        }
    }

    pub fn prompt(&self) -> String {
        let pwd = self
            .fe
            .as_ref()
            .map(|fe| fe.pwd())
            .unwrap_or_else(|| "/".to_string());
        format!("mpfs [{pwd}]> ")
    }

    pub fn disconnect(&mut self) {
        if let Some(mut fe) = self.fe.take() {
            if let Err(e) = fe.close() {
                tracing::warn!("close failed: {e}");
            }
        }
    }
}

struct Command {
    name: &'static str,
    aliases: &'static [&'static str],
    args: &'static str,
    help_text: &'static str,
    function: fn(&mut ShellData, &str) -> anyhow::Result<ShellState>,
}

pub struct ShellCli {
    commands: Vec<Command>,
}

impl ShellCli {
    pub fn new() -> ShellCli {
        let mut cli = ShellCli {
            commands: Vec::new(),
        };

        cli.add_command(Command {
            name: "open",
            aliases: &["o"],
            args: "<TARGET>",
            help_text: "Open a connection: a serial port (ttyUSB0, ser:/dev/ttyUSB0,115200), \
                        a telnet host (tn:192.168.1.1,login,passwd) or a websocket host \
                        (ws:192.168.1.1,passwd)",
            function: cmd_open,
        });
        cli.add_command(Command {
            name: "close",
            aliases: &[],
            args: "",
            help_text: "Close the connection to the board",
            function: |data, _| {
                data.disconnect();
                Ok(ShellState::Continue)
            },
        });
        cli.add_command(Command {
            name: "ls",
            aliases: &[],
            args: "",
            help_text: "List remote files",
            function: cmd_ls,
        });
        cli.add_command(Command {
            name: "pwd",
            aliases: &[],
            args: "",
            help_text: "Print the remote working directory",
            function: |data, _| {
                let fe = require_open(data)?;
                println!("{}", fe.pwd());
                Ok(ShellState::Continue)
            },
        });
        cli.add_command(Command {
            name: "cd",
            aliases: &[],
            args: "<TARGET DIR>",
            help_text: "Change the remote working directory",
            function: cmd_cd,
        });
        cli.add_command(Command {
            name: "md",
            aliases: &[],
            args: "<TARGET DIR>",
            help_text: "Create a remote directory",
            function: cmd_md,
        });
        cli.add_command(Command {
            name: "lls",
            aliases: &[],
            args: "",
            help_text: "List files in the local working directory",
            function: cmd_lls,
        });
        cli.add_command(Command {
            name: "lcd",
            aliases: &[],
            args: "<TARGET DIR>",
            help_text: "Change the local working directory",
            function: cmd_lcd,
        });
        cli.add_command(Command {
            name: "lpwd",
            aliases: &[],
            args: "",
            help_text: "Print the local working directory",
            function: |_, _| {
                println!("{}", std::env::current_dir()?.display());
                Ok(ShellState::Continue)
            },
        });
        cli.add_command(Command {
            name: "put",
            aliases: &[],
            args: "<LOCAL FILE> [<LOCAL WORKPATH>] [<REMOTE FILE>]",
            help_text: "Upload a local file or directory tree",
            function: |data, args| cmd_put(data, args, true),
        });
        cli.add_command(Command {
            name: "mput",
            aliases: &[],
            args: "<SELECTION REGEX> [<LOCAL WORKPATH>] [<REMOTE PATH>]",
            help_text: "Upload all local files matching the regular expression",
            function: cmd_mput,
        });
        cli.add_command(Command {
            name: "get",
            aliases: &[],
            args: "<REMOTE FILE> [<LOCAL FILE>]",
            help_text: "Download a remote file or directory tree",
            function: cmd_get,
        });
        cli.add_command(Command {
            name: "mget",
            aliases: &[],
            args: "<SELECTION REGEX> [<LOCAL PATH>]",
            help_text: "Download all remote files matching the regular expression",
            function: cmd_mget,
        });
        cli.add_command(Command {
            name: "rm",
            aliases: &[],
            args: "<REMOTE FILE or DIR>",
            help_text: "Delete a remote file or empty directory",
            function: cmd_rm,
        });
        cli.add_command(Command {
            name: "mrm",
            aliases: &[],
            args: "<SELECTION REGEX>",
            help_text: "Delete all remote files matching the regular expression",
            function: cmd_mrm,
        });
        cli.add_command(Command {
            name: "rmrf",
            aliases: &[],
            args: "<REMOTE FILE or DIR>",
            help_text: "Recursively delete a remote file or directory, after confirmation",
            function: cmd_rmrf,
        });
        cli.add_command(Command {
            name: "mrmrf",
            aliases: &[],
            args: "<SELECTION REGEX>",
            help_text: "Recursively delete everything matching the regular expression",
            function: cmd_mrmrf,
        });
        cli.add_command(Command {
            name: "synchronize",
            aliases: &[],
            args: "<LOCAL DIR> [<LOCAL WORKPATH>] [<REMOTE DIR>]",
            help_text: "Upload a tree, then delete remote files that are gone locally",
            function: cmd_synchronize,
        });
        cli.add_command(Command {
            name: "cat",
            aliases: &["c"],
            args: "<REMOTE FILE>",
            help_text: "Print the contents of a remote file",
            function: cmd_cat,
        });
        cli.add_command(Command {
            name: "exec",
            aliases: &["e"],
            args: "<PYTHON CODE>",
            help_text: "Execute Python code on the board",
            function: cmd_exec,
        });
        cli.add_command(Command {
            name: "execfile",
            aliases: &["ef"],
            args: "<REMOTE .PY FILE>",
            help_text: "Execute a Python file on the board",
            function: cmd_execfile,
        });
        cli.add_command(Command {
            name: "runfile",
            aliases: &["rf"],
            args: "<LOCAL FILE> [<LOCAL WORKPATH>] [<REMOTE FILE>]",
            help_text: "Upload a local Python file, then execute it on the board",
            function: cmd_runfile,
        });
        cli.add_command(Command {
            name: "repl",
            aliases: &["r"],
            args: "[<INITIAL CHARS>]",
            help_text: "Enter the MicroPython REPL",
            function: cmd_repl,
        });
        cli.add_command(Command {
            name: "mpyc",
            aliases: &[],
            args: "<LOCAL PYTHON FILE>",
            help_text: "Compile a Python file with mpy-cross (must be in PATH)",
            function: cmd_mpyc,
        });
        cli.add_command(Command {
            name: "view",
            aliases: &["v"],
            args: "",
            help_text: "List local serial ports",
            function: cmd_view,
        });
        cli.add_command(Command {
            name: "quit",
            aliases: &["q"],
            args: "",
            help_text: "Exit this shell",
            function: |data, _| {
                data.disconnect();
                Ok(ShellState::Stop)
            },
        });

        cli
    }

    fn add_command(&mut self, command: Command) {
        self.commands.push(command)
    }

    pub fn handle_line(&self, data: &mut ShellData, line: &str) -> ShellState {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return ShellState::Continue;
        }

        let verb = line.split_whitespace().next().expect("non-empty line");
        let args = line[verb.len()..].trim_start();

        if verb == "help" {
            self.print_help();
            return ShellState::Continue;
        }

        let command = self
            .commands
            .iter()
            .find(|c| c.name == verb || c.aliases.contains(&verb));

        let Some(command) = command else {
            println!("Unknown command '{verb}'");
            println!("Enter 'help' for a list of commands");
            return ShellState::Continue;
        };

        match (command.function)(data, args) {
            Ok(next) => next,
            Err(e) => {
                data.had_error = true;
                // `{:#}` keeps the whole context chain on one line.
                error_line(&format!("{e:#}"));
                ShellState::Continue
            }
        }
    }

    fn print_help(&self) {
        println!("The following commands are available:\n");
        for cmd in &self.commands {
            let aliases = if cmd.aliases.is_empty() {
                String::new()
            } else {
                format!("({})", cmd.aliases.join(", "))
            };
            println!(" {:<12}{:<6} {}", cmd.name, aliases, cmd.help_text);
            if !cmd.args.is_empty() {
                println!("{:20} usage: {} {}", "", cmd.name, cmd.args);
            }
        }
        println!();
    }
}

/// Run the interactive loop until `quit` or end of input.
pub fn run_interactive(cli: &ShellCli, data: &mut ShellData) -> anyhow::Result<()> {
    let mut rl = rustyline::DefaultEditor::new()?;

    loop {
        match rl.readline(&data.prompt()) {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                if cli.handle_line(data, &line) == ShellState::Stop {
                    break;
                }
            }
            Err(e) => {
                use rustyline::error::ReadlineError;
                match e {
                    ReadlineError::Eof | ReadlineError::Interrupted => break,
                    actual_error => {
                        println!("Error handling input: {actual_error:?}");
                        break;
                    }
                }
            }
        }
    }

    data.disconnect();
    Ok(())
}

fn error_line(msg: &str) {
    println!("\n{}\n", msg.red());
}

fn require_open(data: &mut ShellData) -> anyhow::Result<&mut Box<dyn FsOps>> {
    data.fe
        .as_mut()
        .ok_or_else(|| anyhow!("Not connected to device. Use 'open' first."))
}

/// Split an argument string into tokens, honoring single and double
/// quotes so file names with spaces survive.
fn tokenize(input: &str) -> anyhow::Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }

    if quote.is_some() {
        bail!("Invalid filename given: unterminated quote in '{input}'");
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn list_serial_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(_) => Vec::new(),
    }
}

/// Expand a bare port name into a full connection string.
fn normalize_target(target: &str) -> String {
    let known_prefix = target.starts_with("ser:/dev/")
        || target.starts_with("ser:COM")
        || target.starts_with("tn:")
        || target.starts_with("ws:");
    if known_prefix {
        return target.to_string();
    }

    if cfg!(windows) || target.contains("/dev") {
        format!("ser:{target}")
    } else {
        format!("ser:/dev/{target}")
    }
}

/// Prompt for the credentials the connection string left out.
fn fill_credentials(spec: &mut ConnectSpec) -> anyhow::Result<()> {
    match spec {
        ConnectSpec::Serial { .. } => {}
        ConnectSpec::Telnet { login, password, .. } => {
            if login.is_none() {
                print!("telnet login : ");
                std::io::stdout().flush()?;
                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer)?;
                *login = Some(answer.trim().to_string());
            }
            if password.is_none() {
                *password = Some(rpassword::prompt_password("telnet passwd: ")?);
            }
        }
        ConnectSpec::Websocket { password, .. } => {
            if password.is_none() {
                *password = Some(rpassword::prompt_password("webrepl passwd: ")?);
            }
        }
    }
    Ok(())
}

fn cmd_open(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let mut target = args.trim().to_string();
    if target.is_empty() {
        // Fall back to the first enumerated serial port.
        match list_serial_ports().into_iter().next() {
            Some(port) => target = port.rsplit('/').next().unwrap_or(&port).to_string(),
            None => bail!("Missing argument: <PORT>"),
        }
    }

    let target = normalize_target(&target);
    let mut spec: ConnectSpec = target.parse()?;
    fill_credentials(&mut spec)?;

    data.disconnect();
    let fs = RemoteFs::open(&spec, data.hard_reset)
        .with_context(|| format!("Failed to open: {target}"))?;

    println!("Connected to {}", fs.sysname());

    data.fe = Some(if data.caching {
        Box::new(CachedFs::new(fs))
    } else {
        Box::new(fs)
    });
    data.open_args = Some(target.clone());
    state::update(&target, SessionState::Shell)?;

    Ok(ShellState::Continue)
}

fn cmd_ls(data: &mut ShellData, _args: &str) -> anyhow::Result<ShellState> {
    let fe = require_open(data)?;

    let mut entries = fe.ls()?;
    entries.sort_by(|a, b| b.kind.cmp(&a.kind).then(a.name.cmp(&b.name)));

    let pwd = fe.pwd();
    println!("\nRemote files in '{pwd}':\n");

    if pwd != "/" {
        println!(" <dir> ..");
    }
    for entry in entries {
        match entry.kind {
            EntryKind::Dir => println!(" <dir> {}", entry.name),
            EntryKind::File => println!(" <file/empty_dir> {}", entry.name),
        }
    }
    println!();

    Ok(ShellState::Continue)
}

fn single_token(args: &str, usage: &str) -> anyhow::Result<String> {
    let tokens = tokenize(args)?;
    match tokens.as_slice() {
        [] => bail!("Missing argument: {usage}"),
        [one] => Ok(one.clone()),
        _ => bail!("Only one argument allowed: {usage}"),
    }
}

fn cmd_cd(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<REMOTE DIR>")?;
    let fe = require_open(data)?;
    fe.cd(&target)?;
    Ok(ShellState::Continue)
}

fn cmd_md(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<REMOTE DIR>")?;
    let fe = require_open(data)?;
    fe.md(&target, true)?;
    Ok(ShellState::Continue)
}

fn cmd_lls(_data: &mut ShellData, _args: &str) -> anyhow::Result<ShellState> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();
    for entry in std::fs::read_dir(".")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.path().is_dir() {
            dirs.push(name);
        } else {
            files.push(name);
        }
    }
    dirs.sort();
    files.sort();

    println!("\nLocal files:\n");
    for d in dirs {
        println!(" <dir> {d}");
    }
    for f in files {
        println!("       {f}");
    }
    println!();

    Ok(ShellState::Continue)
}

fn cmd_lcd(_data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<LOCAL DIR>")?;
    std::env::set_current_dir(&target).with_context(|| format!("cannot cd to '{target}'"))?;
    Ok(ShellState::Continue)
}

/// Resolved arguments of `put`-shaped commands.
struct PutArgs {
    local: PathBuf,
    remote: String,
}

fn parse_put_args(args: &str) -> anyhow::Result<PutArgs> {
    let tokens = tokenize(args)?;
    if tokens.is_empty() {
        bail!("Missing arguments: <LOCAL FILE> [<LOCAL WORKPATH>] [<REMOTE FILE>]");
    }
    if tokens.len() > 3 {
        bail!("Only one, two or three arguments allowed: <LOCAL FILE> [<LOCAL WORKPATH>] [<REMOTE FILE>]");
    }

    let cwd = std::env::current_dir()?;
    let (local_raw, work_path, remote) = match tokens.as_slice() {
        [local, work, remote] => (local.clone(), PathBuf::from(work), remote.clone()),
        [local, work] => (local.clone(), PathBuf::from(work), local.clone()),
        [local] => (local.clone(), cwd.clone(), local.clone()),
        _ => unreachable!(),
    };

    // The local name may already be anchored below the work path.
    let local = {
        let candidate = PathBuf::from(&local_raw);
        if candidate.starts_with(&work_path) {
            candidate
        } else {
            work_path.join(&local_raw)
        }
    };

    let remote = remote.trim_start_matches("./").to_string();
    Ok(PutArgs { local, remote })
}

/// Relative paths of every directory and file below `root`, sorted so
/// parents come before children.
fn walk_local(root: &Path) -> anyhow::Result<(Vec<String>, Vec<String>)> {
    fn recurse(
        dir: &Path,
        rel: &str,
        dirs: &mut Vec<String>,
        files: &mut Vec<String>,
    ) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = if rel.is_empty() {
                name
            } else {
                format!("{rel}/{name}")
            };
            if entry.path().is_dir() {
                dirs.push(child_rel.clone());
                recurse(&entry.path(), &child_rel, dirs, files)?;
            } else {
                files.push(child_rel);
            }
        }
        Ok(())
    }

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    recurse(root, "", &mut dirs, &mut files)?;
    dirs.sort();
    files.sort();
    Ok((dirs, files))
}

fn do_put(data: &mut ShellData, put: &PutArgs, verbose: bool) -> anyhow::Result<()> {
    let fe = require_open(data)?;

    if put.local.is_dir() {
        // Create the remote skeleton first, then upload file by file.
        fe.md(&put.remote, false)?;
        let (dirs, files) = walk_local(&put.local)?;
        for dir in &dirs {
            fe.md(&format!("{}/{}", put.remote, dir), false)?;
        }

        let total = files.len();
        for (index, rel) in files.iter().enumerate() {
            let src = put.local.join(rel);
            let size = std::fs::metadata(&src)?.len();
            if verbose {
                println!(
                    "[{}/{}] Writing file {}({}kb)",
                    index + 1,
                    total,
                    rel,
                    size / 1024 + 1
                );
            }
            fe.put(&src, &format!("{}/{}", put.remote, rel))?;
        }
        if verbose {
            println!("Upload done");
        }
    } else if put.local.is_file() {
        let size = std::fs::metadata(&put.local)?.len();
        if verbose {
            println!("[1/1] Writing file {}({}kb)", put.remote, size / 1024 + 1);
        }
        match fe.put(&put.local, &put.remote)? {
            PutOutcome::Unchanged => tracing::debug!("unchanged, skipped {}", put.remote),
            PutOutcome::Written(_) | PutOutcome::CreatedDir => {}
        }
        if verbose {
            println!("Upload done");
        }
    } else {
        bail!("There is no file or path {}", put.local.display());
    }

    Ok(())
}

fn cmd_put(data: &mut ShellData, args: &str, verbose: bool) -> anyhow::Result<ShellState> {
    let put = parse_put_args(args)?;
    do_put(data, &put, verbose)?;
    Ok(ShellState::Continue)
}

fn cmd_mput(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let tokens = tokenize(args)?;
    if tokens.is_empty() {
        bail!("Missing arguments: <SELECTION REGEX> [<LOCAL WORKPATH>] [<REMOTE PATH>]");
    }

    let pattern = tokens[0].clone();
    let work_path = tokens
        .get(1)
        .map(PathBuf::from)
        .unwrap_or(std::env::current_dir()?);
    let remote_path = tokens.get(2).map(String::as_str);

    let fe = require_open(data)?;
    for name in fe.mput(&work_path, &pattern, remote_path)? {
        println!(" * put {name}");
    }
    Ok(ShellState::Continue)
}

fn cmd_get(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let tokens = tokenize(args)?;
    let (remote, local) = match tokens.as_slice() {
        [] => bail!("Missing arguments: <REMOTE FILE> [<LOCAL FILE>]"),
        [remote] => (remote.clone(), PathBuf::from(remote)),
        [remote, local] => (remote.clone(), PathBuf::from(local)),
        _ => bail!("Only one or two arguments allowed: <REMOTE FILE> [<LOCAL FILE>]"),
    };

    let fe = require_open(data)?;
    fe.get(&remote, &local, true)?;
    Ok(ShellState::Continue)
}

fn cmd_mget(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let tokens = tokenize(args)?;
    if tokens.is_empty() {
        bail!("Missing argument: <SELECTION REGEX> [<LOCAL PATH>]");
    }
    let pattern = tokens[0].clone();
    let local = tokens
        .get(1)
        .map(PathBuf::from)
        .unwrap_or(std::env::current_dir()?);

    let fe = require_open(data)?;
    for name in fe.mget(&pattern, &local)? {
        println!(" * get {name}");
    }
    Ok(ShellState::Continue)
}

fn cmd_rm(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<REMOTE FILE>")?;
    let fe = require_open(data)?;
    fe.rm(&target)?;
    Ok(ShellState::Continue)
}

fn cmd_mrm(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    if args.trim().is_empty() {
        bail!("Missing argument: <SELECTION REGEX>");
    }
    let fe = require_open(data)?;
    for name in fe.mrm(args.trim())? {
        println!(" * rm {name}");
    }
    Ok(ShellState::Continue)
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} (y/N): ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y"))
}

fn cmd_rmrf(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<REMOTE DIR>")?;
    if !confirm(&format!("really delete '{target}' and everything below it?"))? {
        return Ok(ShellState::Continue);
    }
    let fe = require_open(data)?;
    fe.rmrf(&target)?;
    Ok(ShellState::Continue)
}

fn cmd_mrmrf(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    if args.trim().is_empty() {
        bail!("Missing argument: <SELECTION REGEX>");
    }
    if !confirm(&format!(
        "really delete everything matching '{}'?",
        args.trim()
    ))? {
        return Ok(ShellState::Continue);
    }
    let fe = require_open(data)?;
    for name in fe.mrmrf(args.trim())? {
        println!(" * rmrf {name}");
    }
    Ok(ShellState::Continue)
}

fn cmd_synchronize(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let put = parse_put_args(args)?;
    do_put(data, &put, false)?;

    let fe = require_open(data)?;
    for path in fe.synchronize(&put.local, &put.remote)? {
        println!(" * rm /{path}");
    }
    println!("Synchronize done\n");
    Ok(ShellState::Continue)
}

fn cmd_cat(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<REMOTE FILE>")?;
    let fe = require_open(data)?;
    println!("{}", fe.gets(&target)?);
    Ok(ShellState::Continue)
}

/// Strip the indentation of the first line from every line, so code
/// pasted out of an editor still parses. Lines that do not carry the
/// prefix are flagged instead of silently shifted.
fn trim_code_block(code: &str) -> String {
    let lines: Vec<&str> = code.split_inclusive('\n').collect();
    let Some(first) = lines.first() else {
        return code.to_string();
    };

    let indent = first.len() - first.trim_start_matches(' ').len();
    if indent == 0 {
        return code.to_string();
    }

    let prefix = " ".repeat(indent);
    let mut out = String::new();
    for line in &lines {
        if let Some(stripped) = line.strip_prefix(prefix.as_str()) {
            out.push_str(stripped);
        } else {
            out.push_str(line.trim_end_matches(['\r', '\n']).trim());
            out.push_str(" # <- IndentationError\n");
        }
    }
    out
}

fn cmd_exec(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    if args.is_empty() {
        bail!("Missing argument: <PYTHON CODE>");
    }
    let fe = require_open(data)?;

    let code = trim_code_block(args).replace("\\n", "\n");
    // Give fire-and-forget code a beat to produce its output.
    let code = format!("{code}\r\nimport time\r\ntime.sleep(0.1)\n");

    let board = fe.board_mut();
    let (output, error) = board.exec_raw(&code, std::time::Duration::from_secs(1), false)?;

    let text = String::from_utf8_lossy(&output);
    let text = text.trim_matches('\u{4}');
    if !text.is_empty() {
        println!("{text}");
    }
    if !error.is_empty() {
        data.had_error = true;
        error_line(String::from_utf8_lossy(&error).trim());
    }

    Ok(ShellState::Continue)
}

fn cmd_execfile(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<REMOTE .PY FILE>")?;
    if !target.ends_with(".py") {
        bail!("Remote file must be a python executable file");
    }

    let fe = require_open(data)?;

    if fe.exec_tool() == ExecTool::Repl {
        // No auxiliary shell on this board; run it through the REPL
        // passthrough instead.
        return cmd_repl(data, &format!("exec(open('{target}').read())\r\n"));
    }

    let output = fe.exec_in_shell(&format!("mpy {target}"))?;
    let text = String::from_utf8_lossy(&output).into_owned();

    // Drop the shell prompt echo around the program's own output.
    let splitter = regex::Regex::new(r"sh[\s/>]+").expect("static pattern");
    let body: String = splitter.split(&text).skip(1).collect::<Vec<_>>().join("");
    println!("{}", body.trim_end());

    // The shell excursion reboots the interpreter.
    fe.reattach()?;

    Ok(ShellState::Continue)
}

fn cmd_runfile(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let put = parse_put_args(args)?;
    do_put(data, &put, false)?;
    cmd_execfile(data, &put.remote)
}

fn cmd_repl(data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let port = data.open_args.clone();
    let fe = require_open(data)?;

    fe.teardown()?;
    if let Some(port) = &port {
        state::update(port, SessionState::Repl)?;
    }

    let initial = if args.is_empty() { None } else { Some(args) };
    let result = term::run(fe.board_mut().connection_mut(), initial);

    fe.reattach()?;
    if let Some(port) = &port {
        state::update(port, SessionState::Shell)?;
    }

    result?;
    Ok(ShellState::Continue)
}

fn cmd_mpyc(_data: &mut ShellData, args: &str) -> anyhow::Result<ShellState> {
    let target = single_token(args, "<LOCAL FILE>")?;

    let status = std::process::Command::new("mpy-cross")
        .arg(&target)
        .status()
        .context("failed to spawn mpy-cross (is it in PATH?)")?;
    if !status.success() {
        bail!("Failed to compile: {target}");
    }
    Ok(ShellState::Continue)
}

fn cmd_view(data: &mut ShellData, _args: &str) -> anyhow::Result<ShellState> {
    println!("looking for all ports...");
    let ports = list_serial_ports();
    if ports.is_empty() {
        println!("serial not found!");
    } else {
        for port in &ports {
            let short = port.rsplit('/').next().unwrap_or(port);
            println!("serial name : {port} : {short}");
        }
    }

    if let Some(open_args) = &data.open_args {
        println!("current open_args {open_args}");
    }
    Ok(ShellState::Continue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tokenizer_honors_quotes() {
        assert_eq!(
            tokenize("one 'two words' three").unwrap(),
            vec!["one", "two words", "three"]
        );
        assert_eq!(
            tokenize(r#"get "a file.py" local.py"#).unwrap(),
            vec!["get", "a file.py", "local.py"]
        );
        assert!(tokenize("broken 'quote").is_err());
    }

    #[test]
    fn bare_ports_get_the_serial_prefix() {
        assert_eq!(normalize_target("ser:/dev/ttyUSB0"), "ser:/dev/ttyUSB0");
        assert_eq!(normalize_target("tn:192.168.1.1"), "tn:192.168.1.1");
        if cfg!(windows) {
            assert_eq!(normalize_target("COM3"), "ser:COM3");
        } else {
            assert_eq!(normalize_target("ttyUSB0"), "ser:/dev/ttyUSB0");
            assert_eq!(normalize_target("/dev/ttyACM1"), "ser:/dev/ttyACM1");
        }
    }

    #[test]
    fn code_blocks_are_dedented_by_the_first_line() {
        let code = "    for i in range(3):\n        print(i)\n";
        assert_eq!(
            trim_code_block(code),
            "for i in range(3):\n    print(i)\n"
        );

        let ragged = "    a = 1\n  b = 2\n";
        assert_eq!(
            trim_code_block(ragged),
            "a = 1\nb = 2 # <- IndentationError\n"
        );

        let flat = "print('x')\n";
        assert_eq!(trim_code_block(flat), flat);
    }
}
