//! Durable queue envelope and idempotency keys

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Filename prefix for pending envelopes
pub const QUEUED_PREFIX: &str = "queued-";

/// Filename suffix for pending envelopes
pub const QUEUED_SUFFIX: &str = ".json";

/// A payload that no sink accepted, persisted for replay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEnvelope {
    /// Payload type tag (`health`, ...)
    pub payload_type: String,

    /// Original payload object
    pub payload: serde_json::Value,

    /// Idempotency key forwarded to every sink
    pub id: String,
}

impl QueuedEnvelope {
    pub fn new(
        payload_type: impl Into<String>,
        payload: serde_json::Value,
        id: impl Into<String>,
    ) -> Self {
        Self {
            payload_type: payload_type.into(),
            payload,
            id: id.into(),
        }
    }

    /// On-disk file name for this envelope
    pub fn file_name(&self) -> String {
        queued_file_name(&self.id)
    }
}

/// Deterministic key identifying one logical delivery
pub fn idempotency_key(payload_type: &str, store: &str, ts: &DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        payload_type,
        store,
        ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    )
}

/// Make a key safe to use as a single path component
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '-',
            other => other,
        })
        .collect()
}

/// `queued-<sanitized key>.json`
pub fn queued_file_name(key: &str) -> String {
    format!("{}{}{}", QUEUED_PREFIX, sanitize_key(key), QUEUED_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_idempotency_key_format() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            idempotency_key("health", "STORE", &ts),
            "health-STORE-2024-01-01T12:00:00Z"
        );
    }

    #[test]
    fn test_file_name_has_no_colons() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 30).unwrap();
        let key = idempotency_key("health", "STORE", &ts);
        let name = queued_file_name(&key);
        assert_eq!(name, "queued-health-STORE-2024-01-01T12-05-30Z.json");
        assert!(!name.contains(':'));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = QueuedEnvelope::new("health", serde_json::json!({"x": 1}), "id-1");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["payload_type"], "health");
        assert_eq!(value["payload"]["x"], 1);
        assert_eq!(value["id"], "id-1");
    }
}
