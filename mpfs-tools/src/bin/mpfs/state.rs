//! Host-side session state.
//!
//! `state_temp.json` records, per connection string, whether the board was
//! last driven by the file shell or left inside a REPL passthrough, so
//! outside tooling can tell what state the device prompt is in.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;

pub const STATE_FILE: &str = "state_temp.json";

/// What currently owns the device prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Shell,
    Repl,
}

impl SessionState {
    fn as_str(self) -> &'static str {
        match self {
            SessionState::Shell => "mpfshell",
            SessionState::Repl => "repl",
        }
    }
}

/// Record `state` for `port`, merging with whatever the file already
/// holds.
pub fn update(port: &str, state: SessionState) -> anyhow::Result<()> {
    update_file(Path::new(STATE_FILE), port, state)
}

fn update_file(path: &Path, port: &str, state: SessionState) -> anyhow::Result<()> {
    let mut map: HashMap<String, String> = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("corrupt state file {}", path.display()))?,
        Err(_) => HashMap::new(),
    };

    map.insert(port.to_string(), state.as_str().to_string());

    let rendered = serde_json::to_string_pretty(&map)?;
    std::fs::write(path, rendered)
        .with_context(|| format!("cannot write state file {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn updates_merge_with_existing_entries() {
        let path = std::env::temp_dir().join(format!("mpfs-state-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);

        update_file(&path, "ser:/dev/ttyUSB0,115200", SessionState::Shell).unwrap();
        update_file(&path, "ws:192.168.1.2", SessionState::Repl).unwrap();
        update_file(&path, "ser:/dev/ttyUSB0,115200", SessionState::Repl).unwrap();

        let map: HashMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["ser:/dev/ttyUSB0,115200"], "repl");
        assert_eq!(map["ws:192.168.1.2"], "repl");

        let _ = std::fs::remove_file(&path);
    }
}
