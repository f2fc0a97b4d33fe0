//! A scripted in-memory board.
//!
//! [`FakeBoard`] implements [`Connection`] and behaves like a MicroPython
//! board on the other end of the wire: it answers reset volleys with its
//! banner, speaks the raw REPL framing (`OK`, output, `\x04`, error,
//! `\x04`, `>`) and interprets exactly the snippet shapes the file system
//! façade emits against an in-memory file tree. Used for mocking things
//! in tests and for dry runs.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::{Connection, ConnectionError};

const DEFAULT_BANNER: &str =
    "MicroPython v1.19.1 on 2022-06-18; FakeBoard with STM32F405RG\r\nType \"help()\" for more information.";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceMode {
    Friendly,
    Raw,
    Shell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    Read,
    Write,
}

#[derive(Debug)]
struct OpenFile {
    path: String,
    mode: OpenMode,
}

#[derive(Debug)]
struct State {
    mode: DeviceMode,
    banner: String,
    cwd: String,
    fs: BTreeMap<String, Node>,
    output: VecDeque<u8>,
    command: Vec<u8>,
    shell_line: Vec<u8>,
    open_file: Option<OpenFile>,
    script_output: BTreeMap<String, String>,
    exec_count: usize,
    write_chunk_count: usize,
    fail_next: usize,
    no_micropython: bool,
    wedged: bool,
}

impl State {
    fn push(&mut self, text: &str) {
        self.output.extend(text.as_bytes());
    }

    fn push_banner(&mut self) {
        if self.no_micropython {
            let line = "-sh: mpy: command not found\r\nsh /> ".to_string();
            self.push(&line);
        } else {
            let banner = self.banner.clone();
            self.push("\r\n");
            self.push(&banner);
            self.push("\r\n>>> ");
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        path == "/" || matches!(self.fs.get(path), Some(Node::Dir))
    }

    fn parent_exists(&self, path: &str) -> bool {
        match path.rfind('/') {
            Some(0) => true,
            Some(idx) => self.is_dir(&path[..idx]),
            None => false,
        }
    }

    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        self.fs
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }
}

type Reply = (String, String);

fn ok(out: impl Into<String>) -> Reply {
    (out.into(), String::new())
}

fn os_error(line: &str) -> Reply {
    (
        String::new(),
        format!(
            "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n{line}\r\n"
        ),
    )
}

const ENOENT: &str = "OSError: [Errno 2] ENOENT";
const EACCES: &str = "OSError: [Errno 13] EACCES";
const EEXIST: &str = "OSError: [Errno 17] EEXIST";
const ENOTDIR: &str = "OSError: [Errno 20] ENOTDIR";
const EISDIR: &str = "OSError: [Errno 21] EISDIR";

/// Undo the single-quote escaping of the snippet emitter.
fn unescape(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Extract the single-quoted argument out of `call`, given the text
/// before and after it.
fn quoted_arg<'a>(call: &'a str, before: &str, after: &str) -> Option<String> {
    let rest = call.strip_prefix(before)?;
    let inner = rest.strip_suffix(after)?;
    Some(unescape(inner))
}

fn render_list(names: &[String]) -> String {
    let quoted: Vec<String> = names
        .iter()
        .map(|n| format!("'{}'", n.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

fn execute(st: &mut State, cmd: &str) -> Reply {
    let cmd = cmd.trim_start_matches(['\r', '\n']);
    let trimmed = cmd.trim_end_matches(['\r', '\n']);

    if trimmed.starts_with("import ") || trimmed == "gc.collect()" {
        return ok("");
    }

    if trimmed.starts_with("while True:") {
        return read_loop(st);
    }

    if !trimmed.contains('\n') {
        if let Some(expr) = trimmed
            .strip_prefix("print(")
            .and_then(|s| s.strip_suffix(')'))
        {
            return print_expr(st, expr);
        }
    }

    if let Some(path) = quoted_arg(trimmed, "f = open('", "', 'wb')") {
        return open_file(st, &path, OpenMode::Write, false);
    }
    if let Some(path) = quoted_arg(trimmed, "f = open('", "', 'a')") {
        return touch_file(st, &path);
    }
    if let Some(path) = quoted_arg(trimmed, "f = open('", "', 'rb')") {
        return open_file(st, &path, OpenMode::Read, true);
    }
    if let Some(hex_chunk) = quoted_arg(trimmed, "f.write(ubinascii.unhexlify('", "'))") {
        return write_chunk(st, &hex_chunk);
    }
    if trimmed == "f.close()" {
        st.open_file = None;
        return ok("");
    }

    // Anything else is user code from an `exec`; run it "successfully"
    // with no output.
    ok("")
}

fn print_expr(st: &mut State, expr: &str) -> Reply {
    if expr == "os.getcwd()" {
        let cwd = st.cwd.clone();
        return ok(format!("{cwd}\r\n"));
    }
    if expr == "uos.system('pwd')" {
        let cwd = st.cwd.clone();
        return ok(format!("{cwd}\r\n0\r\n"));
    }

    let listdir_arg = quoted_arg(expr, "os.listdir('", "')")
        .or_else(|| quoted_arg(expr, "[i[0] for i in uos.ilistdir('", "')]"));
    if let Some(path) = listdir_arg {
        return list_dir(st, &path);
    }

    if let Some(path) =
        quoted_arg(expr, "os.remove('", "')").or_else(|| quoted_arg(expr, "uos.remove('", "')"))
    {
        return remove(st, &path, expr.starts_with("uos."));
    }
    if let Some(path) = quoted_arg(expr, "os.rmdir('", "')") {
        return rmdir(st, &path);
    }
    if let Some(path) =
        quoted_arg(expr, "os.mkdir('", "')").or_else(|| quoted_arg(expr, "uos.mkdir('", "')"))
    {
        return mkdir(st, &path);
    }

    os_error("NameError: name 'expr' isn't defined")
}

fn list_dir(st: &mut State, path: &str) -> Reply {
    let path = if path == "/" {
        "/"
    } else {
        path.trim_end_matches('/')
    };
    if st.is_dir(path) {
        let names = st.children(path);
        ok(format!("{}\r\n", render_list(&names)))
    } else if st.fs.contains_key(path) {
        os_error(ENOTDIR)
    } else {
        os_error(ENOENT)
    }
}

fn remove(st: &mut State, path: &str, uos: bool) -> Reply {
    match st.fs.get(path) {
        Some(Node::File(_)) => {
            st.fs.remove(path);
            ok("None\r\n")
        }
        Some(Node::Dir) if uos => {
            if st.children(path).is_empty() {
                st.fs.remove(path);
                ok("None\r\n")
            } else {
                os_error(EACCES)
            }
        }
        Some(Node::Dir) => os_error(EISDIR),
        None => os_error(ENOENT),
    }
}

fn rmdir(st: &mut State, path: &str) -> Reply {
    match st.fs.get(path) {
        Some(Node::Dir) => {
            if st.children(path).is_empty() {
                st.fs.remove(path);
                ok("None\r\n")
            } else {
                os_error(EACCES)
            }
        }
        Some(Node::File(_)) => os_error(ENOTDIR),
        None => os_error(ENOENT),
    }
}

fn mkdir(st: &mut State, path: &str) -> Reply {
    if path == "/" || st.fs.contains_key(path) {
        return os_error(EEXIST);
    }
    if !st.parent_exists(path) {
        return os_error(ENOENT);
    }
    st.fs.insert(path.to_string(), Node::Dir);
    ok("None\r\n")
}

fn open_file(st: &mut State, path: &str, mode: OpenMode, must_exist: bool) -> Reply {
    match st.fs.get(path) {
        Some(Node::Dir) => {
            return match mode {
                OpenMode::Write => os_error(EACCES),
                OpenMode::Read => os_error(EISDIR),
            };
        }
        Some(Node::File(_)) => {}
        None => {
            if path == "/" {
                return os_error(EISDIR);
            }
            if must_exist {
                return os_error(ENOENT);
            }
            if !st.parent_exists(path) {
                return os_error(ENOENT);
            }
        }
    }

    if mode == OpenMode::Write {
        st.fs.insert(path.to_string(), Node::File(Vec::new()));
    }
    st.open_file = Some(OpenFile {
        path: path.to_string(),
        mode,
    });
    ok("")
}

fn touch_file(st: &mut State, path: &str) -> Reply {
    match st.fs.get(path) {
        Some(Node::Dir) => os_error(EISDIR),
        Some(Node::File(_)) => ok(""),
        None if path == "/" => os_error(EISDIR),
        None => {
            if !st.parent_exists(path) {
                return os_error(ENOENT);
            }
            st.fs.insert(path.to_string(), Node::File(Vec::new()));
            ok("")
        }
    }
}

fn write_chunk(st: &mut State, hex_chunk: &str) -> Reply {
    let Some(open) = st.open_file.as_ref() else {
        return os_error("OSError: [Errno 9] EBADF");
    };
    if open.mode != OpenMode::Write {
        return os_error("OSError: [Errno 9] EBADF");
    }
    let Ok(data) = hex::decode(hex_chunk) else {
        return os_error("ValueError: odd-length string");
    };
    let path = open.path.clone();
    if let Some(Node::File(content)) = st.fs.get_mut(&path) {
        content.extend(data);
    }
    st.write_chunk_count += 1;
    ok("")
}

fn read_loop(st: &mut State) -> Reply {
    let Some(open) = st.open_file.as_ref() else {
        return os_error("OSError: [Errno 9] EBADF");
    };
    if open.mode != OpenMode::Read {
        return os_error("OSError: [Errno 9] EBADF");
    }
    match st.fs.get(&open.path) {
        Some(Node::File(content)) => ok(hex::encode(content)),
        _ => os_error(ENOENT),
    }
}

fn feed(st: &mut State, byte: u8) {
    if st.wedged {
        return;
    }

    match st.mode {
        DeviceMode::Friendly => match byte {
            0x01 => {
                st.mode = DeviceMode::Raw;
                st.command.clear();
                st.push("raw REPL; CTRL-B to exit\r\n>");
            }
            0x02 => st.push_banner(),
            _ => {}
        },
        DeviceMode::Raw => match byte {
            0x04 => {
                if st.command.is_empty() {
                    st.mode = DeviceMode::Shell;
                    st.shell_line.clear();
                    st.push("\r\nsh /> ");
                } else {
                    let cmd = String::from_utf8_lossy(&std::mem::take(&mut st.command)).into_owned();
                    st.exec_count += 1;
                    if st.fail_next > 0 {
                        st.fail_next -= 1;
                        return;
                    }
                    let (out, err) = execute(st, &cmd);
                    st.push("OK");
                    st.push(&out);
                    st.push("\x04");
                    st.push(&err);
                    st.push("\x04");
                    st.push(">");
                }
            }
            0x02 => {
                st.command.clear();
                st.mode = DeviceMode::Friendly;
                st.push_banner();
            }
            0x03 => st.command.clear(),
            b => st.command.push(b),
        },
        DeviceMode::Shell => match byte {
            b'\n' => {
                let line = String::from_utf8_lossy(&std::mem::take(&mut st.shell_line))
                    .trim_end_matches('\r')
                    .to_string();
                shell_line(st, &line);
            }
            0x02 | 0x03 | 0x04 => {}
            b => st.shell_line.push(b),
        },
    }
}

fn shell_line(st: &mut State, line: &str) {
    if line == "mpy" {
        // Entering the interpreter from the shell lands at the friendly
        // prompt; the host re-attaches afterwards.
        st.mode = DeviceMode::Friendly;
        return;
    }

    if let Some(file) = line.strip_prefix("mpy ") {
        let echo = format!("mpy {file}\r\n");
        let body = match st.script_output.get(file) {
            Some(canned) => canned.clone(),
            None => {
                let path = format!("/{}", file.trim_start_matches('/'));
                if st.fs.contains_key(&path) || st.fs.contains_key(file) {
                    format!("ran {file}\r\n")
                } else {
                    format!("mpy: cannot open {file}\r\n")
                }
            }
        };
        st.push(&echo);
        st.push(&body);
        st.push("sh /> ");
        return;
    }

    if !line.is_empty() {
        let reply = format!("{line}\r\n-sh: {line}: command not found\r\nsh /> ");
        st.push(&reply);
    }
}

/// A scripted in-memory MicroPython board.
///
/// Cloning the handle is cheap; all clones observe the same board. The
/// [`Connection`] half is obtained with [`FakeBoard::connection`] and fed
/// to [`crate::board::Board::new`].
#[derive(Clone)]
pub struct FakeBoard {
    state: Arc<Mutex<State>>,
}

impl Default for FakeBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBoard {
    /// A board with an empty file system and a generic banner (no model
    /// marker, so the host falls back to the `os` flavor).
    pub fn new() -> Self {
        FakeBoard {
            state: Arc::new(Mutex::new(State {
                mode: DeviceMode::Friendly,
                banner: DEFAULT_BANNER.to_string(),
                cwd: "/".to_string(),
                fs: BTreeMap::new(),
                output: VecDeque::new(),
                command: Vec::new(),
                shell_line: Vec::new(),
                open_file: None,
                script_output: BTreeMap::new(),
                exec_count: 0,
                write_chunk_count: 0,
                fail_next: 0,
                no_micropython: false,
                wedged: false,
            })),
        }
    }

    /// A board whose banner advertises `model` via the
    /// `MicroPython board with <model>` marker.
    pub fn with_model(model: &str) -> Self {
        let board = Self::new();
        board.lock().banner = format!(
            "MicroPython v1.19.1 on 2022-06-18; MicroPython board with {model}\r\nType \"help()\" for more information."
        );
        board
    }

    /// A board advertising itself as an ESP module.
    pub fn esp_module(model: &str) -> Self {
        let board = Self::new();
        board.lock().banner = format!(
            "MicroPython v1.19.1 on 2022-06-18; ESP module with {model}\r\nType \"help()\" for more information."
        );
        board
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake board lock")
    }

    /// The [`Connection`] half, to hand to a driver.
    pub fn connection(&self) -> Box<dyn Connection> {
        Box::new(FakeBoardIo {
            state: Arc::clone(&self.state),
        })
    }

    /// Pretend the device has a shell but no MicroPython.
    pub fn set_no_micropython(&self) {
        self.lock().no_micropython = true;
    }

    /// Stop answering anything at all.
    pub fn set_wedged(&self) {
        self.lock().wedged = true;
    }

    /// Swallow the next `n` framed commands without replying.
    pub fn fail_next_commands(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Change the directory the board reports as its working directory.
    pub fn set_cwd(&self, cwd: &str) {
        self.lock().cwd = cwd.to_string();
    }

    /// Canned output for `mpy <file>` in the shell.
    pub fn set_script_output(&self, file: &str, output: &str) {
        self.lock()
            .script_output
            .insert(file.to_string(), output.to_string());
    }

    /// Create a directory, parents not required.
    pub fn add_dir(&self, path: &str) {
        self.lock().fs.insert(path.to_string(), Node::Dir);
    }

    /// Create a file with `content`, parents not required.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.lock()
            .fs
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    /// Content of the file at `path`, if it exists.
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.lock().fs.get(path) {
            Some(Node::File(content)) => Some(content.clone()),
            _ => None,
        }
    }

    /// Whether a directory exists at `path`.
    pub fn has_dir(&self, path: &str) -> bool {
        self.lock().is_dir(path)
    }

    /// Every path on the board, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.lock().fs.keys().cloned().collect()
    }

    /// Framed commands executed so far (wire transactions).
    pub fn exec_count(&self) -> usize {
        self.lock().exec_count
    }

    /// `f.write(...)` chunks executed so far.
    pub fn write_chunk_count(&self) -> usize {
        self.lock().write_chunk_count
    }
}

struct FakeBoardIo {
    state: Arc<Mutex<State>>,
}

impl Connection for FakeBoardIo {
    fn read(&mut self, n: usize) -> Result<Vec<u8>, ConnectionError> {
        let mut st = self.state.lock().expect("fake board lock");
        let take = n.min(st.output.len());
        Ok(st.output.drain(..take).collect())
    }

    fn bytes_available(&mut self) -> Result<usize, ConnectionError> {
        let st = self.state.lock().expect("fake board lock");
        Ok(st.output.len())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut st = self.state.lock().expect("fake board lock");
        for &byte in data {
            feed(&mut st, byte);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }
}
