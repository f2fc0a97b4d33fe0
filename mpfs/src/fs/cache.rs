//! Listing cache decorator.
//!
//! Wraps any [`FsOps`] implementation and memoizes per-directory listings,
//! patching them structurally on every mutation instead of re-listing.
//! The kind probe in [`FsOps::ls`] costs one interpreter round trip per
//! entry, which is what makes this worthwhile on slow links.

use std::collections::HashMap;
use std::path::Path;

use typed_path::UnixPath;

use crate::board::Board;
use crate::error::Error;
use crate::fs::{DirEntry, EntryKind, ExecTool, FsOps, PutOutcome};
use crate::ledger::DigestLedger;

/// A [`FsOps`] decorator with a per-directory listing cache.
pub struct CachedFs<F: FsOps> {
    inner: F,
    cache: HashMap<String, Vec<DirEntry>>,
}

impl<F: FsOps> CachedFs<F> {
    /// Wrap `inner` with an empty cache.
    pub fn new(inner: F) -> Self {
        CachedFs {
            inner,
            cache: HashMap::new(),
        }
    }

    /// Unwrap the decorated façade.
    pub fn into_inner(self) -> F {
        self.inner
    }

    fn split(fqn: &str) -> (String, String) {
        let path = UnixPath::new(fqn);
        let parent = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        let name = path
            .file_name()
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        (parent, name)
    }

    fn patch_add(&mut self, fqn: &str, kind: EntryKind) {
        let (parent, name) = Self::split(fqn);
        if let Some(listing) = self.cache.get_mut(&parent) {
            if !listing.iter().any(|e| e.name == name) {
                tracing::debug!(%parent, %name, ?kind, "patching cached listing");
                listing.push(DirEntry::new(name, kind));
            }
        }
    }

    fn patch_remove(&mut self, fqn: &str) {
        let (parent, name) = Self::split(fqn);
        if let Some(listing) = self.cache.get_mut(&parent) {
            listing.retain(|e| e.name != name);
        }
        // A listing cached for the removed path itself is now stale.
        self.cache.remove(fqn);
    }
}

impl<F: FsOps> FsOps for CachedFs<F> {
    fn pwd(&self) -> String {
        self.inner.pwd()
    }

    fn fqn(&self, name: &str) -> String {
        self.inner.fqn(name)
    }

    fn cd(&mut self, target: &str) -> Result<(), Error> {
        self.inner.cd(target)
    }

    fn md(&mut self, target: &str, verify: bool) -> Result<(), Error> {
        self.inner.md(target, verify)?;
        let fqn = self.inner.fqn(target);
        self.patch_add(&fqn, EntryKind::Dir);
        Ok(())
    }

    fn ls(&mut self) -> Result<Vec<DirEntry>, Error> {
        let cwd = self.inner.pwd();
        if let Some(hit) = self.cache.get(&cwd) {
            tracing::debug!(%cwd, "listing cache hit");
            return Ok(hit.clone());
        }

        let entries = self.inner.ls()?;
        self.cache.insert(cwd, entries.clone());
        Ok(entries)
    }

    fn ls_filtered(&mut self, files: bool, dirs: bool) -> Result<Vec<String>, Error> {
        let cwd = self.inner.pwd();
        if let Some(hit) = self.cache.get(&cwd) {
            // Mirror the uncached shape: asking for directories returns
            // the raw name list verbatim, files included.
            if dirs {
                return Ok(hit.iter().map(|e| e.name.clone()).collect());
            }
            if files {
                return Ok(hit
                    .iter()
                    .filter(|e| e.kind == EntryKind::File)
                    .map(|e| e.name.clone())
                    .collect());
            }
            return Ok(Vec::new());
        }

        self.inner.ls_filtered(files, dirs)
    }

    fn rm(&mut self, target: &str) -> Result<(), Error> {
        self.inner.rm(target)?;
        let fqn = self.inner.fqn(target);
        self.patch_remove(&fqn);
        Ok(())
    }

    fn put(&mut self, src: &Path, dst: &str) -> Result<PutOutcome, Error> {
        let outcome = self.inner.put(src, dst)?;
        let fqn = self.inner.fqn(dst);
        match outcome {
            PutOutcome::Written(_) | PutOutcome::Unchanged => {
                self.patch_add(&fqn, EntryKind::File);
            }
            PutOutcome::CreatedDir => {
                self.patch_add(&fqn, EntryKind::Dir);
            }
        }
        Ok(outcome)
    }

    fn get(&mut self, src: &str, dst: &Path, verify: bool) -> Result<(), Error> {
        self.inner.get(src, dst, verify)
    }

    fn gets(&mut self, src: &str) -> Result<String, Error> {
        self.inner.gets(src)
    }

    fn exec_in_shell(&mut self, command: &str) -> Result<Vec<u8>, Error> {
        self.inner.exec_in_shell(command)
    }

    fn ledger(&self) -> &DigestLedger {
        self.inner.ledger()
    }

    fn sysname(&self) -> &str {
        self.inner.sysname()
    }

    fn model(&self) -> Option<&str> {
        self.inner.model()
    }

    fn exec_tool(&self) -> ExecTool {
        self.inner.exec_tool()
    }

    fn board_mut(&mut self) -> &mut Board {
        self.inner.board_mut()
    }

    fn reattach(&mut self) -> Result<(), Error> {
        self.inner.reattach()
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.inner.teardown()
    }

    fn close(&mut self) -> Result<(), Error> {
        self.inner.close()
    }
}
