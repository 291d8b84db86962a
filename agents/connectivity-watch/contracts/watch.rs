//! Watch-mode overrides and one-shot triggers

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Remotely supplied per-store entries, keyed by store id.
///
/// Entries stay as raw JSON so one malformed entry cannot poison the map.
pub type Watchlist = HashMap<String, serde_json::Value>;

/// Store-scoped request for faster polling until `until`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchMode {
    /// Mode label
    pub mode: String,

    /// Expiry
    pub until: DateTime<Utc>,
}

impl WatchMode {
    pub fn new(mode: impl Into<String>, until: DateTime<Utc>) -> Self {
        Self {
            mode: mode.into(),
            until,
        }
    }

    /// Build from a watchlist entry; `None` when `until` is missing or unparsable
    pub fn from_entry(entry: &serde_json::Value) -> Option<Self> {
        let until = entry.get("until")?.as_str()?;
        let until = parse_timestamp(until)?;
        let mode = entry
            .get("mode")
            .and_then(|m| m.as_str())
            .unwrap_or("watch");
        Some(Self::new(mode, until))
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.until
    }
}

/// RFC 3339, or naive ISO-8601 taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Triggers observed (and consumed) during one cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerState {
    /// Token from an unlock marker
    pub unlocked_token: Option<String>,

    /// A send-now marker was present
    pub send_now: bool,
}

impl TriggerState {
    pub fn is_empty(&self) -> bool {
        self.unlocked_token.is_none() && !self.send_now
    }
}
