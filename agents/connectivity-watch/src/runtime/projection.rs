//! Local status projection (`ui/status.json`)

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::contracts::{ProbeCode, TargetStatus};

const STATUS_FILE: &str = "status.json";
const NO_FAILURE: &str = "None recorded";

/// Hover text for the UI controls
const TOOLTIPS: [(&str, &str); 3] = [
    ("status", "Green steady means all clear"),
    ("send", "Uploads status to dashboard now"),
    ("check", "Runs current probes without delay"),
];

/// Traffic-light summary of one probe round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusColor {
    Green,
    Amber,
    Red,
}

/// What the projection shows while unlocked
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub color: StatusColor,
    pub last_failure: Option<String>,
    pub last_upload: Option<DateTime<Utc>>,
    /// Target name to `up` or its failure code
    pub summary: BTreeMap<String, String>,
}

impl StatusSnapshot {
    pub fn from_statuses(
        statuses: &[TargetStatus],
        last_failure: Option<String>,
        last_upload: Option<DateTime<Utc>>,
    ) -> Self {
        let color = if statuses.iter().any(|s| !s.up) {
            StatusColor::Red
        } else if statuses.iter().any(|s| s.code == ProbeCode::Http4xx) {
            StatusColor::Amber
        } else {
            StatusColor::Green
        };

        let summary = statuses
            .iter()
            .map(|s| {
                let value = if s.up { "up".to_string() } else { s.code.to_string() };
                (s.name.clone(), value)
            })
            .collect();

        Self {
            color,
            last_failure,
            last_upload,
            summary,
        }
    }
}

/// Lock-gated status view
pub trait StatusProjection: Send {
    fn lock(&mut self);
    fn unlock(&mut self, token: &str);
    fn is_unlocked(&self) -> bool;
    fn publish(&mut self, snapshot: &StatusSnapshot);
}

/// Writes the projection to `<ui_dir>/status.json`
#[derive(Debug)]
pub struct LocalStatusFile {
    path: PathBuf,
    token: Option<String>,
}

impl LocalStatusFile {
    /// Starts locked, writing the locked document immediately
    pub fn new(ui_dir: impl AsRef<Path>) -> Self {
        let mut projection = Self {
            path: ui_dir.as_ref().join(STATUS_FILE),
            token: None,
        };
        projection.lock();
        projection
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&self, document: &serde_json::Value) {
        let result = self
            .path
            .parent()
            .map(std::fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|_| {
                let body = serde_json::to_vec_pretty(document).map_err(std::io::Error::from)?;
                std::fs::write(&self.path, body)
            });
        if let Err(e) = result {
            tracing::warn!(file = %self.path.display(), error = %e, "Failed to write status projection");
        }
    }
}

impl StatusProjection for LocalStatusFile {
    fn lock(&mut self) {
        self.token = None;
        self.write(&json!({ "locked": true }));
    }

    fn unlock(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    fn is_unlocked(&self) -> bool {
        self.token.is_some()
    }

    fn publish(&mut self, snapshot: &StatusSnapshot) {
        let Some(token) = self.token.clone() else {
            self.lock();
            return;
        };
        self.write(&json!({
            "locked": false,
            "token": token,
            "status": snapshot.color,
            "last_failure_reason": snapshot.last_failure.as_deref().unwrap_or(NO_FAILURE),
            "last_upload": snapshot.last_upload.map(|t| t.to_rfc3339()),
            "summary": snapshot.summary,
            "tooltips": BTreeMap::from(TOOLTIPS),
        }));
    }
}
