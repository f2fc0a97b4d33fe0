//! The remote file system façade.
//!
//! [`RemoteFs`] owns the REPL driver and turns file operations into
//! interpreter snippets, classifying remote `OSError`s into the
//! [`RemoteIoError`] taxonomy. The operation surface is the [`FsOps`]
//! trait so the caching decorator in [`cache`] can wrap a façade without
//! the caller caring which one it holds.

pub mod cache;
mod oserr;
mod snippet;

use std::collections::HashSet;
use std::path::Path;

use typed_path::UnixPath;

use crate::board::{Board, DriverError};
use crate::connection::{self, ConnectSpec};
use crate::error::Error;
use crate::ledger::{DigestLedger, LEDGER_PATH};
use crate::retry::RetryPolicy;

use oserr::RemoteOsError;
use snippet::Snippets;

pub use snippet::OsFlavor;

/// Source bytes per hex chunk on the wire. Kept small enough that a
/// single interpreter line stays well under the raw REPL's input limits.
pub const BIN_CHUNK_SIZE: usize = 1600;

/// A remote file system error, reported to the user verbatim as a single
/// line.
#[derive(thiserror::Error, Debug)]
pub enum RemoteIoError {
    /// The directory does not exist.
    #[error("No such directory: {0}")]
    NoSuchDirectory(String),
    /// The file or directory does not exist.
    #[error("No such file or directory: {0}")]
    NoSuchFileOrDirectory(String),
    /// The WiPy reports missing targets and non-empty directories with the
    /// same errno, so the message hedges.
    #[error("No such file or directory or directory not empty: {0}")]
    NoSuchFileOrDirectoryMaybeNotEmpty(String),
    /// `rm` of a directory that still has children.
    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),
    /// `md` of a name the board rejects.
    #[error("Invalid directory name: {0}")]
    InvalidDirectoryName(String),
    /// The file could not be opened for reading.
    #[error("Failed to read file: {0}")]
    FailedToReadFile(String),
    /// The file could not be created.
    #[error("Failed to create file: {0}")]
    FailedToCreateFile(String),
    /// The write target is an existing directory.
    #[error("Existing directory: {0}")]
    ExistingDirectory(String),
    /// The pattern given to a glob operation does not compile.
    #[error("Error in regular expression: {0}")]
    Pattern(#[from] regex::Error),
}

/// Kind of a directory entry.
///
/// Some ports cannot tell an empty directory from a file, so `File` also
/// covers empty directories; see [`FsOps::ls`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    /// A regular file (or an empty directory, see above).
    File,
    /// A listable, non-empty directory.
    Dir,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::File => f.write_str("F"),
            EntryKind::Dir => f.write_str("D"),
        }
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirEntry {
    /// Entry name, without any path.
    pub name: String,
    /// Probed kind.
    pub kind: EntryKind,
}

impl DirEntry {
    /// Shorthand constructor.
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        DirEntry {
            name: name.into(),
            kind,
        }
    }
}

/// What a [`FsOps::put`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The file was uploaded; this many source bytes went over the wire.
    Written(usize),
    /// The ledger digest matched, nothing was transferred.
    Unchanged,
    /// The source was a directory, so a remote directory was created
    /// instead. The caller is expected to recurse.
    CreatedDir,
}

/// Which tool runs `.py` files on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTool {
    /// The auxiliary command shell (`mpy <file>`).
    Shell,
    /// The REPL itself (`exec(open(f).read())`), used on ESP8266 class
    /// boards that have no auxiliary shell.
    Repl,
}

/// Compile a glob pattern, anchored at the start of the name.
fn anchored(pattern: &str) -> Result<regex::Regex, RemoteIoError> {
    Ok(regex::Regex::new(&format!("^(?:{pattern})"))?)
}

/// The operations a file system façade offers.
///
/// Implemented by [`RemoteFs`] and by the listing-cache decorator
/// [`cache::CachedFs`]. The glob and batch operations are provided in
/// terms of the single-target ones, so a decorator only has to intercept
/// those.
pub trait FsOps {
    /// The remote working directory, always absolute.
    fn pwd(&self) -> String;

    /// Absolute remote path for `name`, joined onto the working directory.
    /// Backslashes are normalized to forward slashes first.
    fn fqn(&self, name: &str) -> String;

    /// Change the remote working directory.
    fn cd(&mut self, target: &str) -> Result<(), Error>;

    /// Create a remote directory. With `verify`, a multi-segment target
    /// has its parents created first; directories that already exist are
    /// silently accepted.
    fn md(&mut self, target: &str, verify: bool) -> Result<(), Error>;

    /// List the working directory with probed entry kinds.
    ///
    /// The kind probe lists each name: a non-empty listing makes it a
    /// directory, an empty one a file. Empty directories are therefore
    /// reported as files, which is the best the interpreter surface of
    /// some ports allows.
    fn ls(&mut self) -> Result<Vec<DirEntry>, Error>;

    /// List names only. With `dirs` the raw name list is returned
    /// verbatim (files included); with only `files` the probed files.
    fn ls_filtered(&mut self, files: bool, dirs: bool) -> Result<Vec<String>, Error>;

    /// Remove a file or empty directory, updating the digest ledger.
    fn rm(&mut self, target: &str) -> Result<(), Error>;

    /// Upload a local file, unless the ledger digest says the board
    /// already holds exactly these bytes. A directory source creates the
    /// remote directory instead.
    fn put(&mut self, src: &Path, dst: &str) -> Result<PutOutcome, Error>;

    /// Download a remote file, or recursively a remote directory. With
    /// `verify` the source must appear in the current listing.
    fn get(&mut self, src: &str, dst: &Path, verify: bool) -> Result<(), Error>;

    /// Fetch a remote file as text; non UTF-8 content is rendered as a
    /// hex dump.
    fn gets(&mut self, src: &str) -> Result<String, Error>;

    /// Run one command in the board's auxiliary shell.
    fn exec_in_shell(&mut self, command: &str) -> Result<Vec<u8>, Error>;

    /// The digest ledger mirror.
    fn ledger(&self) -> &DigestLedger;

    /// Host platform name, consulted by the WiPy root listing rule.
    fn sysname(&self) -> &str;

    /// Detected board model, if any.
    fn model(&self) -> Option<&str>;

    /// How `.py` files are executed on this board.
    fn exec_tool(&self) -> ExecTool;

    /// The REPL driver, for callers that need to speak to the interpreter
    /// directly (`exec`, the interactive passthrough).
    fn board_mut(&mut self) -> &mut Board;

    /// Re-establish the raw REPL session after the connection was used
    /// elsewhere (interactive passthrough, shell excursions).
    fn reattach(&mut self) -> Result<(), Error>;

    /// Leave the raw REPL, keeping the connection open.
    fn teardown(&mut self) -> Result<(), Error>;

    /// Leave the raw REPL and close the connection.
    fn close(&mut self) -> Result<(), Error>;

    /// Remove a file or directory tree, depth first.
    fn rmrf(&mut self, target: &str) -> Result<(), Error> {
        let matches: Vec<DirEntry> = self
            .ls()?
            .into_iter()
            .filter(|e| e.name == target)
            .collect();

        for entry in matches {
            match entry.kind {
                EntryKind::Dir => {
                    let prev = self.pwd();
                    self.cd(&entry.name)?;
                    let children = self.ls()?;
                    let mut result = Ok(());
                    for child in children {
                        let r = match child.kind {
                            EntryKind::Dir => self.rmrf(&child.name),
                            EntryKind::File => self.rm(&child.name),
                        };
                        if let Err(e) = r {
                            result = Err(e);
                            break;
                        }
                    }
                    let restore = self.cd(&prev);
                    result.and(restore)?;
                    self.rm(&entry.name)?;
                }
                EntryKind::File => self.rm(&entry.name)?,
            }
        }

        Ok(())
    }

    /// Remove every file in the working directory matching `pattern`.
    /// Returns the removed names.
    fn mrm(&mut self, pattern: &str) -> Result<Vec<String>, Error> {
        let find = anchored(pattern)?;
        let mut removed = Vec::new();
        for name in self.ls_filtered(true, false)? {
            if find.is_match(&name) {
                self.rm(&name)?;
                removed.push(name);
            }
        }
        Ok(removed)
    }

    /// Remove every entry in the working directory matching `pattern`,
    /// recursing into directories. Returns the removed names.
    fn mrmrf(&mut self, pattern: &str) -> Result<Vec<String>, Error> {
        let find = anchored(pattern)?;
        let mut removed = Vec::new();
        for entry in self.ls()? {
            if find.is_match(&entry.name) {
                self.rmrf(&entry.name)?;
                removed.push(entry.name);
            }
        }
        Ok(removed)
    }

    /// Download every file in the working directory matching `pattern`
    /// into `local_dir`. Returns the downloaded names.
    fn mget(&mut self, pattern: &str, local_dir: &Path) -> Result<Vec<String>, Error> {
        let find = anchored(pattern)?;
        let mut fetched = Vec::new();
        for name in self.ls_filtered(true, false)? {
            if find.is_match(&name) {
                self.get(&name, &local_dir.join(&name), false)?;
                fetched.push(name);
            }
        }
        Ok(fetched)
    }

    /// Upload every file in `local_dir` whose name matches `pattern`.
    /// With `remote_dir` the uploads land below that remote directory.
    /// Returns the uploaded names.
    fn mput(
        &mut self,
        local_dir: &Path,
        pattern: &str,
        remote_dir: Option<&str>,
    ) -> Result<Vec<String>, Error> {
        let find = anchored(pattern)?;
        let mut uploaded = Vec::new();

        for entry in std::fs::read_dir(local_dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if !find.is_match(&name) {
                continue;
            }
            let dst = match remote_dir {
                Some(dir) => format!("{}/{}", dir.trim_end_matches('/'), name),
                None => name.clone(),
            };
            self.put(&path, &dst)?;
            uploaded.push(name);
        }

        Ok(uploaded)
    }

    /// Delete remote files below `remote_dir` that the ledger knows about
    /// but that no longer exist under `local_dir`. The upload half of a
    /// synchronization is the caller's preceding `put` pass. Returns the
    /// removed remote paths.
    fn synchronize(&mut self, local_dir: &Path, remote_dir: &str) -> Result<Vec<String>, Error> {
        let prefix = self.fqn(remote_dir);
        let prefix = prefix.trim_start_matches('/').to_string();

        let mut local = HashSet::new();
        collect_relative_files(local_dir, "", &mut local)?;

        let mut removed = Vec::new();
        for path in self.ledger().paths_with_prefix(&prefix) {
            let rel = match path.strip_prefix(&prefix) {
                Some("") => continue,
                Some(r) if r.starts_with('/') => r[1..].to_string(),
                _ => continue,
            };
            if !local.contains(&rel) {
                self.rm(&format!("/{path}"))?;
                removed.push(path);
            }
        }

        Ok(removed)
    }
}

/// Walk `dir`, collecting file paths relative to the walk root with `/`
/// separators.
fn collect_relative_files(
    dir: &Path,
    rel: &str,
    out: &mut HashSet<String>,
) -> Result<(), std::io::Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(String::from) else {
            continue;
        };
        let child_rel = if rel.is_empty() {
            name.clone()
        } else {
            format!("{rel}/{name}")
        };
        let path = entry.path();
        if path.is_dir() {
            collect_relative_files(&path, &child_rel, out)?;
        } else {
            out.insert(child_rel);
        }
    }
    Ok(())
}

/// A remote failure, split into "the board's file system said no" and
/// "the driver lost the protocol".
enum RemoteFailure {
    Os {
        os: RemoteOsError,
        raw: DriverError,
    },
    Driver(DriverError),
}

impl RemoteFailure {
    fn classify(e: DriverError) -> Self {
        if let DriverError::Interpreter { ref error, .. } = e {
            if let Some(os) = RemoteOsError::from_traceback(error) {
                return RemoteFailure::Os { os, raw: e };
            }
        }
        RemoteFailure::Driver(e)
    }

    /// Surface as a (retryable) driver error.
    fn driver(self) -> Error {
        match self {
            RemoteFailure::Os { raw, .. } => Error::Driver(raw),
            RemoteFailure::Driver(d) => Error::Driver(d),
        }
    }
}

/// The plain file system façade over one board.
pub struct RemoteFs {
    board: Board,
    snippets: Snippets,
    cwd: String,
    sysname: String,
    exec_tool: ExecTool,
    ledger: DigestLedger,
    retry: RetryPolicy,
}

impl RemoteFs {
    /// Open the transport described by `spec` and attach to the board.
    pub fn open(spec: &ConnectSpec, hard_reset: bool) -> Result<Self, Error> {
        let con = connection::open(spec, hard_reset)?;
        Self::attach(Board::new(con))
    }

    /// Attach to a board on an already opened driver: detect the model,
    /// enter the raw REPL, import the helpers, fetch the working directory
    /// and read the digest ledger.
    pub fn attach(board: Board) -> Result<Self, Error> {
        Self::attach_with(board, std::env::consts::OS.to_string(), RetryPolicy::new())
    }

    /// [`RemoteFs::attach`] with an explicit host platform name and retry
    /// policy.
    pub fn attach_with(
        mut board: Board,
        sysname: String,
        retry: RetryPolicy,
    ) -> Result<Self, Error> {
        let model = board.detect_model()?;
        board.exit_raw_repl().map_err(Error::Driver)?;

        let flavor = match model.as_deref() {
            Some("stm32l401") => OsFlavor::Uos,
            _ => OsFlavor::Os,
        };
        let exec_tool = match model.as_deref() {
            Some("ESP8266") => ExecTool::Repl,
            _ => ExecTool::Shell,
        };
        tracing::info!(?model, ?flavor, ?exec_tool, "attaching to board");

        let mut fs = RemoteFs {
            board,
            snippets: Snippets::new(flavor),
            cwd: "/".to_string(),
            sysname,
            exec_tool,
            ledger: DigestLedger::new(),
            retry,
        };

        fs.setup_interpreter()?;
        fs.load_ledger()?;
        Ok(fs)
    }

    /// Enter the raw REPL, import the helper modules and refresh the
    /// working directory from the board.
    fn setup_interpreter(&mut self) -> Result<(), Error> {
        self.board.enter_raw_repl().map_err(Error::Driver)?;
        self.board
            .exec(self.snippets.import_preamble())
            .map_err(Error::Driver)?;

        let cwd = self.board.eval(self.snippets.getcwd()).map_err(Error::Driver)?;
        self.cwd = join_root(&cwd);
        tracing::debug!(cwd = %self.cwd, "working directory");
        Ok(())
    }

    fn load_ledger(&mut self) -> Result<(), Error> {
        let retry = self.retry;
        let data = retry.run(|| self.read_file_once(LEDGER_PATH, LEDGER_PATH, true))?;
        self.ledger.load(&data)?;
        tracing::debug!(entries = self.ledger.len(), "digest ledger loaded");
        Ok(())
    }

    /// The board flavor in use.
    pub fn os_flavor(&self) -> OsFlavor {
        self.snippets.flavor()
    }

    fn eval_remote(&mut self, expression: &str) -> Result<String, RemoteFailure> {
        self.board.eval(expression).map_err(RemoteFailure::classify)
    }

    fn exec_remote(&mut self, command: &str) -> Result<Vec<u8>, RemoteFailure> {
        self.board.exec(command).map_err(RemoteFailure::classify)
    }

    fn list_dir(&mut self, path: &str) -> Result<Vec<String>, RemoteFailure> {
        let expr = self.snippets.listdir(path);
        let rendered = self.eval_remote(&expr)?;
        parse_list_literal(&rendered).ok_or_else(|| {
            RemoteFailure::Driver(DriverError::UnexpectedReply(rendered))
        })
    }

    /// The not-verbatim listing: every name probed for its kind.
    fn probe_entries(&mut self) -> Result<Vec<DirEntry>, Error> {
        let cwd = self.cwd.clone();
        let raw = match self.list_dir(&cwd) {
            Ok(names) => names,
            Err(RemoteFailure::Os { os, .. }) if os.is_missing() => {
                return Err(RemoteIoError::NoSuchDirectory(cwd).into());
            }
            Err(other) => return Err(other.driver()),
        };

        // On the WiPy everything in the root is a mount point; probing
        // them as files is both wrong and slow.
        if self.sysname == "WiPy" && cwd == "/" {
            return Ok(raw
                .into_iter()
                .map(|name| DirEntry::new(name, EntryKind::Dir))
                .collect());
        }

        let mut entries = Vec::with_capacity(raw.len());
        for name in raw {
            let target = self.fqn_of(&name);
            let kind = match self.list_dir(&target) {
                Ok(children) if children.is_empty() => EntryKind::File,
                Ok(_) => EntryKind::Dir,
                Err(RemoteFailure::Os { os, .. }) if os.is_not_a_directory() => EntryKind::File,
                Err(other) => return Err(other.driver()),
            };
            entries.push(DirEntry::new(name, kind));
        }

        Ok(entries)
    }

    fn ls_inner(&mut self) -> Result<Vec<DirEntry>, Error> {
        self.probe_entries()
    }

    fn ls_filtered_inner(&mut self, files: bool, dirs: bool) -> Result<Vec<String>, Error> {
        if dirs {
            // The raw list, verbatim; no kind probe happens at all.
            let cwd = self.cwd.clone();
            return match self.list_dir(&cwd) {
                Ok(names) => Ok(names),
                Err(RemoteFailure::Os { os, .. }) if os.is_missing() => {
                    Err(RemoteIoError::NoSuchDirectory(cwd).into())
                }
                Err(other) => Err(other.driver()),
            };
        }

        if files {
            let entries = self.probe_entries()?;
            return Ok(entries
                .into_iter()
                .filter(|e| e.kind == EntryKind::File)
                .map(|e| e.name)
                .collect());
        }

        Ok(Vec::new())
    }

    fn cd_inner(&mut self, target: &str) -> Result<(), Error> {
        let candidate = if target.starts_with('/') {
            target.replace('\\', "/")
        } else if target == ".." {
            UnixPath::new(&self.cwd)
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string())
        } else {
            self.fqn_of(target)
        };

        match self.list_dir(&candidate) {
            Ok(_) => {
                self.cwd = candidate;
                Ok(())
            }
            Err(RemoteFailure::Os { os, .. }) if os.is_missing() => {
                Err(RemoteIoError::NoSuchDirectory(target.to_string()).into())
            }
            Err(other) => Err(other.driver()),
        }
    }

    fn mkdir_one(&mut self, target: &str) -> Result<(), Error> {
        let fqn = self.fqn_of(target);
        let expr = self.snippets.mkdir(&fqn);
        match self.eval_remote(&expr) {
            Ok(_) => Ok(()),
            Err(RemoteFailure::Os { os, .. }) if os.errno == oserr::RemoteErrno::Eexist => {
                // Already there; treated as success everywhere md is used.
                Ok(())
            }
            Err(RemoteFailure::Os { os, .. }) if os.is_missing() => {
                Err(RemoteIoError::InvalidDirectoryName(target.to_string()).into())
            }
            Err(other) => Err(other.driver()),
        }
    }

    fn md_inner(&mut self, target: &str, verify: bool) -> Result<(), Error> {
        let normalized = target.replace('\\', "/");
        let parts: Vec<&str> = normalized.split('/').filter(|p| !p.is_empty()).collect();

        if verify && parts.len() > 1 {
            let mut current = if normalized.starts_with('/') {
                String::from("/")
            } else {
                String::new()
            };
            for part in &parts[..parts.len() - 1] {
                if !current.is_empty() && !current.ends_with('/') {
                    current.push('/');
                }
                current.push_str(part);
                self.mkdir_one(&current)?;
            }
        }

        self.mkdir_one(&normalized)
    }

    fn rm_inner(&mut self, target: &str) -> Result<(), Error> {
        let fqn = self.fqn_of(target);
        let snippets = self.snippets;

        if snippets.flavor() == OsFlavor::Uos {
            let expr = snippets.remove(&fqn);
            match self.eval_remote(&expr) {
                Ok(_) => return self.write_ledger_after_rm(&fqn),
                Err(failure) => return Err(self.map_rm_failure(failure, target)),
            }
        }

        // First as a file, then as an (empty) directory.
        let remove = snippets.remove(&fqn);
        if self.eval_remote(&remove).is_ok() {
            return self.write_ledger_after_rm(&fqn);
        }

        let rmdir = snippets.rmdir(&fqn);
        match self.eval_remote(&rmdir) {
            Ok(_) => self.write_ledger_after_rm(&fqn),
            Err(failure) => Err(self.map_rm_failure(failure, target)),
        }
    }

    fn map_rm_failure(&self, failure: RemoteFailure, target: &str) -> Error {
        match failure {
            RemoteFailure::Os { os, .. } if os.is_missing() => {
                if self.sysname == "WiPy" {
                    RemoteIoError::NoSuchFileOrDirectoryMaybeNotEmpty(target.to_string()).into()
                } else {
                    RemoteIoError::NoSuchFileOrDirectory(target.to_string()).into()
                }
            }
            RemoteFailure::Os { os, .. } if os.errno == oserr::RemoteErrno::Eacces => {
                RemoteIoError::DirectoryNotEmpty(target.to_string()).into()
            }
            other => other.driver(),
        }
    }

    fn write_ledger_after_rm(&mut self, fqn: &str) -> Result<(), Error> {
        let serialized = self.ledger.rm_sign(fqn);
        self.write_file_once(LEDGER_PATH, &serialized, LEDGER_PATH)
    }

    /// Write `data` to the open-for-write remote `path`, hex chunk by hex
    /// chunk.
    fn write_file_once(&mut self, path: &str, data: &[u8], display: &str) -> Result<(), Error> {
        let snippets = self.snippets;

        self.exec_mapped_write(&snippets.open_write(path), display)?;
        for chunk in data.chunks(BIN_CHUNK_SIZE) {
            let hex_chunk = hex::encode(chunk);
            self.exec_mapped_write(&snippets.write_chunk(&hex_chunk), display)?;
        }
        self.exec_mapped_write(snippets.close_file(), display)?;
        Ok(())
    }

    fn exec_mapped_write(&mut self, command: &str, display: &str) -> Result<(), Error> {
        match self.exec_remote(command) {
            Ok(_) => Ok(()),
            Err(RemoteFailure::Os { os, .. }) if os.is_missing() => {
                Err(RemoteIoError::FailedToCreateFile(display.to_string()).into())
            }
            Err(RemoteFailure::Os { os, .. }) if os.errno == oserr::RemoteErrno::Eacces => {
                Err(RemoteIoError::ExistingDirectory(display.to_string()).into())
            }
            Err(other) => Err(other.driver()),
        }
    }

    /// Read the remote `path` in hex chunks and return the decoded bytes.
    /// With `touch` the file is opened for append first so a missing
    /// parent surfaces before the read loop (and an absent file comes back
    /// empty instead of failing).
    fn read_file_once(&mut self, path: &str, display: &str, touch: bool) -> Result<Vec<u8>, Error> {
        let snippets = self.snippets;

        let mapped = |failure: RemoteFailure, display: &str| match failure {
            RemoteFailure::Os { os, .. } if os.is_missing() => {
                Error::Remote(RemoteIoError::FailedToReadFile(display.to_string()))
            }
            other => other.driver(),
        };

        if touch {
            self.exec_remote(&snippets.open_append(path))
                .map_err(|f| mapped(f, display))?;
            self.exec_remote(snippets.close_file())
                .map_err(|f| mapped(f, display))?;
        }

        self.exec_remote(&snippets.open_read(path))
            .map_err(|f| mapped(f, display))?;
        let captured = self
            .exec_remote(&snippets.read_loop())
            .map_err(|f| mapped(f, display))?;
        self.exec_remote(snippets.close_file())
            .map_err(|f| mapped(f, display))?;

        let text: Vec<u8> = captured
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        hex::decode(&text)
            .map_err(|e| Error::Other(anyhow::anyhow!("garbled hex transfer of {display}: {e}")))
    }

    fn put_file(&mut self, src: &Path, dst: &str) -> Result<PutOutcome, Error> {
        let fqn = self.fqn_of(dst);

        // Snapshot so a failed transfer does not leave the in-memory
        // ledger claiming bytes the board never received; the retry that
        // follows must see the stale digest again.
        let snapshot = self.ledger.clone();

        match self.ledger.verify_sign(src, &fqn)? {
            None => Ok(PutOutcome::Unchanged),
            Some(serialized) => {
                let data = std::fs::read(src)?;
                let result = self
                    .write_file_once(&fqn, &data, dst)
                    .and_then(|()| self.write_file_once(LEDGER_PATH, &serialized, LEDGER_PATH));
                match result {
                    Ok(()) => Ok(PutOutcome::Written(data.len())),
                    Err(e) => {
                        self.ledger = snapshot;
                        Err(e)
                    }
                }
            }
        }
    }

    fn get_tree(&mut self, src: &str, dst: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(dst)?;

        let prev = self.pwd();
        self.cd(src)?;

        let mut result = Ok(());
        match self.ls() {
            Ok(entries) => {
                for entry in entries {
                    if let Err(e) = self.get_impl(&entry.name, &dst.join(&entry.name), false) {
                        result = Err(e);
                        break;
                    }
                }
            }
            Err(e) => result = Err(e),
        }

        let restore = self.cd(&prev);
        result.and(restore)
    }

    fn get_impl(&mut self, src: &str, dst: &Path, verify: bool) -> Result<(), Error> {
        if verify {
            let names = self.ls_filtered(true, true)?;
            if !names.iter().any(|n| n == src) {
                return Err(RemoteIoError::NoSuchFileOrDirectory(self.fqn_of(src)).into());
            }
        }

        let fqn = self.fqn_of(src);

        // Probe for directoriness explicitly instead of relying on the
        // read to fail; the failed-read fallback below stays for boards
        // where the probe itself is unreliable.
        let retry = self.retry;
        let is_dir = retry.run(|| match self.list_dir(&fqn) {
            Ok(_) => Ok(true),
            Err(RemoteFailure::Os { os, .. }) if os.is_not_a_directory() => Ok(false),
            Err(other) => Err(other.driver()),
        })?;
        if is_dir {
            return self.get_tree(src, dst);
        }

        match retry.run(|| self.read_file_once(&fqn, src, true)) {
            Ok(data) => {
                std::fs::write(dst, data)?;
                Ok(())
            }
            Err(Error::Remote(RemoteIoError::FailedToReadFile(_))) => self.get_tree(src, dst),
            Err(e) => Err(e),
        }
    }

    fn fqn_of(&self, name: &str) -> String {
        let name = name.replace('\\', "/");
        UnixPath::new(&self.cwd)
            .join(UnixPath::new(&name))
            .to_string_lossy()
            .into_owned()
    }
}

impl FsOps for RemoteFs {
    fn pwd(&self) -> String {
        self.cwd.clone()
    }

    fn fqn(&self, name: &str) -> String {
        self.fqn_of(name)
    }

    fn cd(&mut self, target: &str) -> Result<(), Error> {
        let retry = self.retry;
        retry.run(|| self.cd_inner(target))
    }

    fn md(&mut self, target: &str, verify: bool) -> Result<(), Error> {
        let retry = self.retry;
        retry.run(|| self.md_inner(target, verify))
    }

    fn ls(&mut self) -> Result<Vec<DirEntry>, Error> {
        let retry = self.retry;
        retry.run(|| self.ls_inner())
    }

    fn ls_filtered(&mut self, files: bool, dirs: bool) -> Result<Vec<String>, Error> {
        let retry = self.retry;
        retry.run(|| self.ls_filtered_inner(files, dirs))
    }

    fn rm(&mut self, target: &str) -> Result<(), Error> {
        let retry = self.retry;
        retry.run(|| self.rm_inner(target))
    }

    fn put(&mut self, src: &Path, dst: &str) -> Result<PutOutcome, Error> {
        if src.is_dir() {
            self.md(dst, false)?;
            return Ok(PutOutcome::CreatedDir);
        }
        let retry = self.retry;
        retry.run(|| self.put_file(src, dst))
    }

    fn get(&mut self, src: &str, dst: &Path, verify: bool) -> Result<(), Error> {
        self.get_impl(src, dst, verify)
    }

    fn gets(&mut self, src: &str) -> Result<String, Error> {
        let fqn = self.fqn_of(src);
        let retry = self.retry;
        let data = retry.run(|| self.read_file_once(&fqn, src, false))?;

        match String::from_utf8(data) {
            Ok(text) => Ok(text),
            Err(err) => {
                let hex_text = hex::encode(err.as_bytes());
                let mut dump = String::from("\nBinary file:\n\n");
                for chunk in hex_text.as_bytes().chunks(64) {
                    dump.push_str(std::str::from_utf8(chunk).expect("hex is ascii"));
                    dump.push('\n');
                }
                Ok(dump)
            }
        }
    }

    fn exec_in_shell(&mut self, command: &str) -> Result<Vec<u8>, Error> {
        self.board
            .exec_command_in_shell(command)
            .map_err(Error::Driver)
    }

    fn ledger(&self) -> &DigestLedger {
        &self.ledger
    }

    fn sysname(&self) -> &str {
        &self.sysname
    }

    fn model(&self) -> Option<&str> {
        self.board.model()
    }

    fn exec_tool(&self) -> ExecTool {
        self.exec_tool
    }

    fn board_mut(&mut self) -> &mut Board {
        &mut self.board
    }

    fn reattach(&mut self) -> Result<(), Error> {
        self.setup_interpreter()
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.board.exit_raw_repl().map_err(Error::Driver)
    }

    fn close(&mut self) -> Result<(), Error> {
        self.board.close().map_err(Error::Driver)
    }
}

/// `posixpath.join("/", s)`: anchor a possibly relative answer from the
/// board at the root.
fn join_root(s: &str) -> String {
    if s.is_empty() {
        return "/".to_string();
    }
    UnixPath::new("/")
        .join(UnixPath::new(s))
        .to_string_lossy()
        .into_owned()
}

/// Parse the interpreter's rendering of a list of strings, e.g.
/// `['boot.py', 'lib']`.
fn parse_list_literal(s: &str) -> Option<Vec<String>> {
    let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
    let mut items = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(&quote) = chars.peek() else { break };
        if quote != '\'' && quote != '"' {
            return None;
        }
        chars.next();

        let mut item = String::new();
        loop {
            match chars.next()? {
                '\\' => {
                    let escaped = chars.next()?;
                    item.push(match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        other => other,
                    });
                }
                c if c == quote => break,
                c => item.push(c),
            }
        }
        items.push(item);
    }

    Some(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_empty_and_plain_lists() {
        assert_eq!(parse_list_literal("[]").unwrap(), Vec::<String>::new());
        assert_eq!(
            parse_list_literal("['boot.py', 'lib', 'main.py']").unwrap(),
            vec!["boot.py", "lib", "main.py"]
        );
    }

    #[test]
    fn parses_escapes_and_mixed_quotes() {
        assert_eq!(
            parse_list_literal(r#"['it\'s', "a\\b"]"#).unwrap(),
            vec!["it's", r"a\b"]
        );
    }

    #[test]
    fn rejects_non_lists() {
        assert!(parse_list_literal("Traceback (most recent...)").is_none());
        assert!(parse_list_literal("[1, 2]").is_none());
    }

    #[test]
    fn join_root_anchors_relative_answers() {
        assert_eq!(join_root(""), "/");
        assert_eq!(join_root("flash"), "/flash");
        assert_eq!(join_root("/flash"), "/flash");
    }
}
