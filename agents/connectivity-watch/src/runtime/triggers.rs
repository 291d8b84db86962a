//! Filesystem triggers
//!
//! External tools drop marker files into the trigger directory: `SENDNOW`
//! requests an immediate upload and `UNLOCK_<token>` unlocks the status
//! projection. Reading a marker deletes it, so each fires exactly once.

use std::path::{Path, PathBuf};

use crate::contracts::TriggerState;

pub const SEND_NOW_FILE: &str = "SENDNOW";
pub const UNLOCK_PREFIX: &str = "UNLOCK_";
const DEFAULT_TOKEN: &str = "default";

#[derive(Debug, Clone)]
pub struct TriggerReader {
    dir: PathBuf,
}

impl TriggerReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Consume pending markers; at most one unlock token per read
    pub fn read(&self) -> TriggerState {
        TriggerState {
            unlocked_token: self.consume_unlock(),
            send_now: self.consume_send_now(),
        }
    }

    fn consume_send_now(&self) -> bool {
        let path = self.dir.join(SEND_NOW_FILE);
        if !path.is_file() {
            return false;
        }
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(error = %e, "Could not remove send-now marker");
        }
        tracing::info!("Send-now trigger consumed");
        true
    }

    fn consume_unlock(&self) -> Option<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.dir.display(), error = %e, "Trigger directory unreadable");
                return None;
            }
        };

        let mut markers: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let token = name.strip_prefix(UNLOCK_PREFIX)?.to_string();
                Some((token, entry.path()))
            })
            .collect();
        markers.sort();

        let (token, path) = markers.into_iter().next()?;
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "Could not remove unlock marker");
            }
        }
        let token = if token.is_empty() {
            DEFAULT_TOKEN.to_string()
        } else {
            token
        };
        tracing::info!(token = %token, "Unlock trigger consumed");
        Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_now_and_unlock() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SENDNOW"), "").unwrap();
        std::fs::write(dir.path().join("UNLOCK_demo"), "").unwrap();

        let reader = TriggerReader::new(dir.path());
        let state = reader.read();
        assert!(state.send_now);
        assert_eq!(state.unlocked_token.as_deref(), Some("demo"));
        assert!(!dir.path().join("SENDNOW").exists());
        assert!(!dir.path().join("UNLOCK_demo").exists());

        assert!(reader.read().is_empty());
    }

    #[test]
    fn test_empty_token_becomes_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UNLOCK_"), "").unwrap();
        let state = TriggerReader::new(dir.path()).read();
        assert_eq!(state.unlocked_token.as_deref(), Some("default"));
        assert!(!state.send_now);
    }

    #[test]
    fn test_one_unlock_per_read() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("UNLOCK_b"), "").unwrap();
        std::fs::write(dir.path().join("UNLOCK_a"), "").unwrap();

        let reader = TriggerReader::new(dir.path());
        assert_eq!(reader.read().unlocked_token.as_deref(), Some("a"));
        assert_eq!(reader.read().unlocked_token.as_deref(), Some("b"));
        assert_eq!(reader.read().unlocked_token, None);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reader = TriggerReader::new(dir.path().join("nope"));
        assert!(reader.read().is_empty());
    }
}
