//! Classification of remote `OSError` tracebacks.
//!
//! The board reports file system failures as an interpreter traceback in
//! the error segment of the framed reply. The last line carries the
//! exception; this module tokenizes it into an errno the façade can
//! branch on, instead of substring-matching whole tracebacks.

/// The errno tokens the façade distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteErrno {
    Enoent,
    Eacces,
    Eexist,
    Enodev,
    Einval,
    Ebadf,
    Enotdir,
    /// An `OSError` whose errno we do not recognize. Historically these
    /// are treated like the not-existing family.
    Other,
}

/// A classified remote `OSError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteOsError {
    pub errno: RemoteErrno,
    pub message: String,
}

const TOKENS: &[(&str, RemoteErrno)] = &[
    ("ENOENT", RemoteErrno::Enoent),
    ("EACCES", RemoteErrno::Eacces),
    ("EEXIST", RemoteErrno::Eexist),
    ("ENODEV", RemoteErrno::Enodev),
    ("EINVAL", RemoteErrno::Einval),
    ("EBADF", RemoteErrno::Ebadf),
    ("ENOTDIR", RemoteErrno::Enotdir),
];

// MicroPython often reports bare numeric errnos ("OSError: 2") instead of
// symbolic ones, depending on the port.
const NUMERIC: &[(&str, RemoteErrno)] = &[
    ("2", RemoteErrno::Enoent),
    ("13", RemoteErrno::Eacces),
    ("17", RemoteErrno::Eexist),
    ("19", RemoteErrno::Enodev),
    ("20", RemoteErrno::Enotdir),
    ("22", RemoteErrno::Einval),
    ("9", RemoteErrno::Ebadf),
];

impl RemoteOsError {
    /// Classify the error segment of a framed reply. Returns `None` when
    /// the traceback is not an `OSError` at all (those stay driver
    /// errors).
    pub(crate) fn from_traceback(error_output: &[u8]) -> Option<RemoteOsError> {
        let text = String::from_utf8_lossy(error_output);
        let last = text.lines().rev().find(|l| !l.trim().is_empty())?.trim();

        if !last.contains("OSError") {
            return None;
        }

        let message = last.to_string();

        for (token, errno) in TOKENS {
            if last.contains(token) {
                return Some(RemoteOsError {
                    errno: *errno,
                    message,
                });
            }
        }

        if let Some(rest) = last.split("OSError:").nth(1) {
            let bare = rest
                .trim()
                .trim_start_matches("[Errno ")
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .unwrap_or("");
            for (token, errno) in NUMERIC {
                if bare == *token {
                    return Some(RemoteOsError {
                        errno: *errno,
                        message,
                    });
                }
            }
        }

        Some(RemoteOsError {
            errno: RemoteErrno::Other,
            message,
        })
    }

    /// Whether this error means "no such file or directory" in the wide
    /// sense the original tooling used (ENOENT, ENODEV, EINVAL and any
    /// unrecognized OSError).
    pub(crate) fn is_missing(&self) -> bool {
        matches!(
            self.errno,
            RemoteErrno::Enoent | RemoteErrno::Enodev | RemoteErrno::Einval | RemoteErrno::Other
        )
    }

    /// Whether a directory probe hitting this error proves the probed name
    /// is not a listable directory.
    pub(crate) fn is_not_a_directory(&self) -> bool {
        self.is_missing() || matches!(self.errno, RemoteErrno::Ebadf | RemoteErrno::Enotdir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const TRACEBACK: &str = "Traceback (most recent call last):\r\n  File \"<stdin>\", line 1, in <module>\r\n";

    #[test_case("OSError: [Errno 2] ENOENT", RemoteErrno::Enoent; "symbolic enoent")]
    #[test_case("OSError: 2", RemoteErrno::Enoent; "numeric enoent")]
    #[test_case("OSError: [Errno 13] EACCES", RemoteErrno::Eacces; "symbolic eacces")]
    #[test_case("OSError: [Errno 17] EEXIST", RemoteErrno::Eexist; "symbolic eexist")]
    #[test_case("OSError: 20", RemoteErrno::Enotdir; "numeric enotdir")]
    #[test_case("OSError: [Errno 9] EBADF", RemoteErrno::Ebadf; "symbolic ebadf")]
    fn classifies_last_line(last: &str, errno: RemoteErrno) {
        let raw = format!("{TRACEBACK}{last}\r\n");
        let err = RemoteOsError::from_traceback(raw.as_bytes()).unwrap();
        assert_eq!(err.errno, errno);
        assert_eq!(err.message, last);
    }

    #[test]
    fn unrecognized_oserror_is_other_and_counts_as_missing() {
        let raw = format!("{TRACEBACK}OSError: 110\r\n");
        let err = RemoteOsError::from_traceback(raw.as_bytes()).unwrap();
        assert_eq!(err.errno, RemoteErrno::Other);
        assert!(err.is_missing());
    }

    #[test]
    fn non_oserror_tracebacks_are_not_classified() {
        let raw = format!("{TRACEBACK}NameError: name 'foo' isn't defined\r\n");
        assert_eq!(RemoteOsError::from_traceback(raw.as_bytes()), None);
        assert_eq!(RemoteOsError::from_traceback(b""), None);
    }
}
