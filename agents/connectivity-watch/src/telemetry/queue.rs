//! Durable on-disk queue of undelivered envelopes
//!
//! One file per idempotency key. A file's presence means "pending"; claiming
//! an entry removes the file before delivery is retried.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::{Result, TelemetryError};
use crate::contracts::{QueuedEnvelope, QUEUED_PREFIX, QUEUED_SUFFIX};

#[derive(Debug, Clone)]
pub struct QueueStorage {
    dir: PathBuf,
}

impl QueueStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist an envelope; `Ok(false)` when its key is already pending
    pub async fn save(&self, envelope: QueuedEnvelope) -> Result<bool> {
        let storage = self.clone();
        blocking(move || storage.save_blocking(&envelope)).await
    }

    /// Pending entries, oldest first
    pub async fn pending(&self) -> Result<Vec<PathBuf>> {
        let storage = self.clone();
        blocking(move || storage.pending_blocking()).await
    }

    /// Read and remove one entry; `None` if it vanished or was malformed
    pub async fn claim(&self, path: PathBuf) -> Result<Option<QueuedEnvelope>> {
        blocking(move || Ok(claim_blocking(&path))).await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.pending().await?.len())
    }

    /// Atomic write: temp file in the queue directory, then a no-clobber
    /// rename onto the final name
    pub fn save_blocking(&self, envelope: &QueuedEnvelope) -> Result<bool> {
        std::fs::create_dir_all(&self.dir)?;
        let target = self.dir.join(envelope.file_name());
        if target.exists() {
            tracing::debug!(key = %envelope.id, "Envelope already queued");
            return Ok(false);
        }

        let body = serde_json::to_vec(envelope)?;
        let mut temp = tempfile::Builder::new()
            .prefix(".pending-")
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        temp.write_all(&body)?;
        temp.as_file().sync_all()?;

        match temp.persist_noclobber(&target) {
            Ok(_) => {
                tracing::info!(key = %envelope.id, file = %target.display(), "Queued envelope");
                Ok(true)
            }
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(key = %envelope.id, "Envelope already queued");
                Ok(false)
            }
            Err(e) => Err(TelemetryError::Io(e.error)),
        }
    }

    pub fn pending_blocking(&self) -> Result<Vec<PathBuf>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pending: Vec<(SystemTime, String, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !(name.starts_with(QUEUED_PREFIX) && name.ends_with(QUEUED_SUFFIX)) {
                    return None;
                }
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                Some((modified, name, entry.path()))
            })
            .collect();

        pending.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(pending.into_iter().map(|(_, _, path)| path).collect())
    }
}

fn claim_blocking(path: &Path) -> Option<QueuedEnvelope> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!(file = %path.display(), error = %e, "Queued entry vanished");
            return None;
        }
    };
    if let Err(e) = std::fs::remove_file(path) {
        tracing::warn!(file = %path.display(), error = %e, "Could not remove queued entry");
    }

    match serde_json::from_slice(&content) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            tracing::warn!(file = %path.display(), error = %e, "Discarding malformed queued entry");
            None
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TelemetryError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}
