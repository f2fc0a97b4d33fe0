//! Emitter for the interpreter snippets the façade runs on the board.
//!
//! The remote interpreter is treated as a small embedded DSL: every
//! snippet shape lives here, and every path travels through [`quote`] so
//! a quote or backslash in a file name cannot break out of its literal.

use crate::fs::BIN_CHUNK_SIZE;

/// Which standard library flavor the board exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFlavor {
    /// The regular `os` module.
    Os,
    /// Boards that only ship `uos` (e.g. the stm32l401 builds).
    Uos,
}

/// Escape `path` for use inside a single-quoted interpreter literal.
pub(crate) fn quote(path: &str) -> String {
    path.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Snippet factory for one board flavor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snippets {
    flavor: OsFlavor,
}

impl Snippets {
    pub(crate) fn new(flavor: OsFlavor) -> Self {
        Snippets { flavor }
    }

    pub(crate) fn flavor(&self) -> OsFlavor {
        self.flavor
    }

    /// The modules imported once at session setup.
    pub(crate) fn import_preamble(&self) -> &'static str {
        match self.flavor {
            OsFlavor::Os => "import os, sys, ubinascii",
            OsFlavor::Uos => "import sys, ubinascii, uos",
        }
    }

    /// Expression yielding the working directory.
    pub(crate) fn getcwd(&self) -> &'static str {
        match self.flavor {
            OsFlavor::Os => "os.getcwd()",
            OsFlavor::Uos => "uos.system('pwd')",
        }
    }

    /// Expression yielding the name list of `path`.
    pub(crate) fn listdir(&self, path: &str) -> String {
        match self.flavor {
            OsFlavor::Os => format!("os.listdir('{}')", quote(path)),
            OsFlavor::Uos => format!("[i[0] for i in uos.ilistdir('{}')]", quote(path)),
        }
    }

    pub(crate) fn remove(&self, path: &str) -> String {
        match self.flavor {
            OsFlavor::Os => format!("os.remove('{}')", quote(path)),
            OsFlavor::Uos => format!("uos.remove('{}')", quote(path)),
        }
    }

    /// `rmdir` only exists on the `os` flavor; `uos` boards delete
    /// directories through `uos.remove`.
    pub(crate) fn rmdir(&self, path: &str) -> String {
        format!("os.rmdir('{}')", quote(path))
    }

    pub(crate) fn mkdir(&self, path: &str) -> String {
        match self.flavor {
            OsFlavor::Os => format!("os.mkdir('{}')", quote(path)),
            OsFlavor::Uos => format!("uos.mkdir('{}')", quote(path)),
        }
    }

    pub(crate) fn open_write(&self, path: &str) -> String {
        format!("f = open('{}', 'wb')", quote(path))
    }

    pub(crate) fn open_append(&self, path: &str) -> String {
        format!("f = open('{}', 'a')", quote(path))
    }

    pub(crate) fn open_read(&self, path: &str) -> String {
        format!("f = open('{}', 'rb')", quote(path))
    }

    /// Write one hex-encoded chunk to the open file.
    pub(crate) fn write_chunk(&self, hex_chunk: &str) -> String {
        format!("f.write(ubinascii.unhexlify('{hex_chunk}'))")
    }

    /// Stream the open file to stdout as hex, chunk by chunk.
    pub(crate) fn read_loop(&self) -> String {
        format!(
            "while True:\r\n  c = ubinascii.hexlify(f.read({BIN_CHUNK_SIZE}))\r\n  if not len(c):\r\n    break\r\n  sys.stdout.write(c)\r\n"
        )
    }

    pub(crate) fn close_file(&self) -> &'static str {
        "f.close()"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn quoting_escapes_backslashes_and_single_quotes() {
        assert_eq!(quote(r"it's"), r"it\'s");
        assert_eq!(quote(r"a\b"), r"a\\b");
        assert_eq!(quote("plain/path.py"), "plain/path.py");
    }

    #[test]
    fn listdir_uses_the_flavor_projection() {
        let os = Snippets::new(OsFlavor::Os);
        let uos = Snippets::new(OsFlavor::Uos);
        assert_eq!(os.listdir("/lib"), "os.listdir('/lib')");
        assert_eq!(
            uos.listdir("/lib"),
            "[i[0] for i in uos.ilistdir('/lib')]"
        );
    }

    #[test]
    fn quoted_path_cannot_break_out_of_the_literal() {
        let os = Snippets::new(OsFlavor::Os);
        let hostile = "a') or __import__('sys";
        assert_eq!(
            os.listdir(hostile),
            r"os.listdir('a\') or __import__(\'sys')"
        );
    }
}
