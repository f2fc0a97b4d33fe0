//! The content-addressed upload ledger.
//!
//! The board keeps a single file, [`LEDGER_PATH`], mapping every uploaded
//! path to the MD5 digest of the bytes last written there. Before an
//! upload the façade consults the ledger and skips the transfer when the
//! digest is unchanged. The on-board rendering is the hex encoding of
//! CRLF-joined single-entry mapping literals, one per path.

use std::collections::BTreeMap;
use std::path::Path;

/// Fixed location of the ledger on the board.
pub const LEDGER_PATH: &str = "/sign";

/// Rendering of an empty ledger (hex of a lone CRLF).
const EMPTY_LEDGER: &[u8] = b"0d0a";

/// The ledger file on the board could not be decoded.
#[derive(thiserror::Error, Debug)]
pub enum LedgerParseError {
    /// The file content is not valid hex.
    #[error("ledger content is not hex encoded")]
    BadHex(#[from] hex::FromHexError),
    /// The hex decoded content is not UTF-8.
    #[error("ledger content is not UTF-8")]
    BadUtf8(#[from] std::string::FromUtf8Error),
    /// A line does not have the `{'path': 'digest'}` shape.
    #[error("malformed ledger line: {0}")]
    BadLine(String),
}

/// In-memory mirror of the on-board digest ledger.
///
/// Paths are stored with their leading slash stripped. Digests are 32
/// lowercase hex characters. Iteration order is sorted by path, which
/// keeps the serialized form deterministic; `load` accepts any order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DigestLedger {
    entries: BTreeMap<String, String>,
}

/// MD5 digest of `data` as 32 lowercase hex characters.
pub fn digest(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn normalize(path: &str) -> &str {
    path.strip_prefix('/').unwrap_or(path)
}

impl DigestLedger {
    /// An empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no path is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The stored digest for `remote_path`, if any.
    pub fn get(&self, remote_path: &str) -> Option<&str> {
        self.entries.get(normalize(remote_path)).map(String::as_str)
    }

    /// Merge the serialized ledger read back from the board.
    ///
    /// Empty content and the empty rendering `0d0a` are both valid empty
    /// ledgers (the file may not exist yet, or hold a single CRLF).
    pub fn load(&mut self, data: &[u8]) -> Result<(), LedgerParseError> {
        if data.is_empty() || data == EMPTY_LEDGER {
            return Ok(());
        }

        let decoded = hex::decode(data)?;
        let text = String::from_utf8(decoded)?;

        for line in text.split("\r\n") {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (path, digest) = parse_entry(line)
                .ok_or_else(|| LedgerParseError::BadLine(line.to_string()))?;
            self.entries.insert(path, digest);
        }

        Ok(())
    }

    /// Serialize to the on-board rendering.
    pub fn serialize(&self) -> Vec<u8> {
        let mut text = String::new();
        for (path, digest) in &self.entries {
            text.push_str(&format!("{{'{path}': '{digest}'}}"));
            text.push_str("\r\n");
        }
        if text.is_empty() {
            text.push_str("\r\n");
        }
        hex::encode(text.as_bytes()).into_bytes()
    }

    /// Check `local` against the digest stored for `remote_path`.
    ///
    /// Returns the new serialized ledger when the digest was absent or
    /// stale (the entry is updated first), or `None` when the file on the
    /// board already holds these bytes and the upload can be skipped.
    pub fn verify_sign(
        &mut self,
        local: &Path,
        remote_path: &str,
    ) -> Result<Option<Vec<u8>>, std::io::Error> {
        let data = std::fs::read(local)?;
        let new = digest(&data);
        let key = normalize(remote_path);

        match self.entries.get(key) {
            Some(old) if *old == new => {
                tracing::debug!(remote_path, "digest unchanged, skipping upload");
                Ok(None)
            }
            _ => {
                self.entries.insert(key.to_string(), new);
                Ok(Some(self.serialize()))
            }
        }
    }

    /// Drop the entry for `remote_path` and return the new serialized
    /// ledger. Removing the ledger's own path clears the whole map.
    pub fn rm_sign(&mut self, remote_path: &str) -> Vec<u8> {
        let key = normalize(remote_path);
        if key == normalize(LEDGER_PATH) {
            self.entries.clear();
        } else {
            self.entries.remove(key);
        }
        self.serialize()
    }

    /// Every tracked path starting with `prefix` (leading slash ignored).
    pub fn paths_with_prefix(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize(prefix);
        self.entries
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Parse one `{'path': 'digest'}` line.
fn parse_entry(line: &str) -> Option<(String, String)> {
    let inner = line.strip_prefix("{'")?.strip_suffix("'}")?;
    let (path, digest) = inner.split_once("': '")?;
    if path.is_empty() || digest.len() != 32 {
        return None;
    }
    Some((path.to_string(), digest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ledger_with(entries: &[(&str, &str)]) -> DigestLedger {
        let mut ledger = DigestLedger::new();
        for (path, digest) in entries {
            ledger
                .entries
                .insert(path.to_string(), digest.to_string());
        }
        ledger
    }

    #[test]
    fn digest_is_32_lowercase_hex() {
        let d = digest(b"hello micropython");
        assert_eq!(d.len(), 32);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn load_of_empty_inputs_yields_empty_map() {
        let mut ledger = DigestLedger::new();
        ledger.load(b"").unwrap();
        assert!(ledger.is_empty());
        ledger.load(b"0d0a").unwrap();
        assert!(ledger.is_empty());
    }

    #[test]
    fn serialize_of_empty_map_is_the_empty_rendering() {
        assert_eq!(DigestLedger::new().serialize(), b"0d0a".to_vec());
    }

    #[test]
    fn round_trips_through_serialize_and_load() {
        let ledger = ledger_with(&[
            ("boot.py", "d41d8cd98f00b204e9800998ecf8427e"),
            ("lib/util.py", "9e107d9d372bb6826bd81d3542a419d6"),
        ]);

        let mut reloaded = DigestLedger::new();
        reloaded.load(&ledger.serialize()).unwrap();
        assert_eq!(reloaded, ledger);
    }

    #[test]
    fn rendering_is_crlf_joined_mapping_literals() {
        let ledger = ledger_with(&[("main.py", "d41d8cd98f00b204e9800998ecf8427e")]);
        let decoded = hex::decode(ledger.serialize()).unwrap();
        assert_eq!(
            String::from_utf8(decoded).unwrap(),
            "{'main.py': 'd41d8cd98f00b204e9800998ecf8427e'}\r\n"
        );
    }

    #[test]
    fn rm_sign_of_ledger_path_clears_everything() {
        let mut ledger = ledger_with(&[
            ("a.py", "d41d8cd98f00b204e9800998ecf8427e"),
            ("b.py", "9e107d9d372bb6826bd81d3542a419d6"),
        ]);
        ledger.rm_sign(LEDGER_PATH);
        assert!(ledger.is_empty());
    }

    #[test]
    fn rm_sign_of_one_path_removes_exactly_that_entry() {
        let mut ledger = ledger_with(&[
            ("a.py", "d41d8cd98f00b204e9800998ecf8427e"),
            ("b.py", "9e107d9d372bb6826bd81d3542a419d6"),
        ]);
        ledger.rm_sign("/a.py");
        assert_eq!(ledger.get("a.py"), None);
        assert_eq!(ledger.get("/b.py"), Some("9e107d9d372bb6826bd81d3542a419d6"));
    }

    #[test]
    fn paths_are_stored_without_leading_slash() {
        let mut ledger = DigestLedger::new();
        ledger
            .entries
            .insert("flash/main.py".to_string(), "d41d8cd98f00b204e9800998ecf8427e".into());
        assert!(ledger.get("/flash/main.py").is_some());
        assert_eq!(ledger.paths_with_prefix("/flash"), vec!["flash/main.py"]);
    }

    #[test]
    fn rejects_garbage_content() {
        let mut ledger = DigestLedger::new();
        assert!(ledger.load(b"zz").is_err());

        let bad_line = hex::encode("not a mapping\r\n");
        assert!(ledger.load(bad_line.as_bytes()).is_err());
    }
}
