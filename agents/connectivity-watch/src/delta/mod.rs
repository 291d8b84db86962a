//! Delta logger
//!
//! Persists a cycle's statuses only when something changed or the heartbeat
//! is due. Each emission appends rows to a day-stamped CSV and one line to a
//! day-stamped JSONL file, then prunes log files older than the retention
//! window.

use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::contracts::{HealthPayload, TargetStatus};
use crate::error::{AgentError, Result};
use crate::telemetry::metrics::AgentMetrics;

/// CSV header row
pub const CSV_HEADER: [&str; 8] = [
    "timestamp", "target", "up", "code", "tcp_ms", "tls_ms", "http_ms", "note",
];

/// Log files older than this are pruned after a write
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Change-triggered, heartbeat-backed status logger
pub struct DeltaLogger {
    store: String,
    heartbeat: chrono::Duration,
    retention: Duration,
    log_dir: PathBuf,
    prefix: String,
    last_status: HashMap<String, TargetStatus>,
    last_written: Option<DateTime<Utc>>,
    metrics: Option<AgentMetrics>,
}

impl DeltaLogger {
    pub fn new(
        store: impl Into<String>,
        heartbeat: Duration,
        log_dir: impl Into<PathBuf>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            store: store.into(),
            heartbeat: chrono::Duration::from_std(heartbeat).unwrap_or(chrono::Duration::MAX),
            retention: DEFAULT_RETENTION,
            log_dir: log_dir.into(),
            prefix: prefix.into(),
            last_status: HashMap::new(),
            last_written: None,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn last_written(&self) -> Option<DateTime<Utc>> {
        self.last_written
    }

    /// Last emitted status for a target
    pub fn last_status(&self, name: &str) -> Option<&TargetStatus> {
        self.last_status.get(name)
    }

    /// True when nothing was written yet, the heartbeat is due, or any
    /// status differs from the last emitted one for the same target
    pub fn should_emit(&self, statuses: &[TargetStatus], now: DateTime<Utc>) -> bool {
        let Some(last) = self.last_written else {
            return true;
        };
        if now - last >= self.heartbeat {
            return true;
        }
        statuses.iter().any(|status| match self.last_status.get(&status.name) {
            Some(previous) => previous.differs_from(status),
            None => true,
        })
    }

    /// Write the payload if it is worth emitting; returns whether it was
    pub fn record(&mut self, payload: &HealthPayload) -> Result<bool> {
        let now = payload.ts;
        if !self.should_emit(&payload.targets, now) {
            return Ok(false);
        }

        std::fs::create_dir_all(&self.log_dir)?;
        let (csv_path, jsonl_path) = self.log_paths(now);
        self.append_csv(&csv_path, payload)?;
        self.append_jsonl(&jsonl_path, payload)?;

        for status in &payload.targets {
            self.last_status.insert(status.name.clone(), status.clone());
        }
        self.last_written = Some(now);

        if let Some(metrics) = &self.metrics {
            metrics.record_emission();
        }
        tracing::debug!(
            store = %self.store,
            targets = payload.targets.len(),
            csv = %csv_path.display(),
            "Recorded status delta"
        );

        self.prune(&[csv_path, jsonl_path]);
        Ok(true)
    }

    /// `<prefix><MMDDYYYY>.csv` and `.jsonl`, local day
    pub fn log_paths(&self, when: DateTime<Utc>) -> (PathBuf, PathBuf) {
        let stamp = when.with_timezone(&Local).format("%m%d%Y").to_string();
        (
            self.log_dir.join(format!("{}{}.csv", self.prefix, stamp)),
            self.log_dir.join(format!("{}{}.jsonl", self.prefix, stamp)),
        )
    }

    fn append_csv(&self, path: &Path, payload: &HealthPayload) -> Result<()> {
        let existed = path.exists();
        let mut out = String::new();
        if !existed {
            out.push_str(&CSV_HEADER.join(","));
            out.push('\n');
        }
        let ts = payload.ts.to_rfc3339();
        for status in &payload.targets {
            out.push_str(&csv_row(&ts, status));
            out.push('\n');
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(out.as_bytes())?;
        Ok(())
    }

    fn append_jsonl(&self, path: &Path, payload: &HealthPayload) -> Result<()> {
        let mut line = serde_json::to_string(payload)
            .map_err(|e| AgentError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Best-effort removal of this logger's files past retention.
    /// Modification times come from the system clock, so the horizon does too.
    fn prune(&self, current: &[PathBuf]) {
        let Some(horizon) = SystemTime::now().checked_sub(self.retention) else {
            return;
        };
        let entries = match std::fs::read_dir(&self.log_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(error = %e, "Log directory not readable for pruning");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let ours = name.starts_with(&self.prefix)
                && (name.ends_with(".csv") || name.ends_with(".jsonl"));
            if !ours || current.contains(&entry.path()) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| modified < horizon)
                .unwrap_or(false);
            if stale {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    tracing::debug!(file = %name, error = %e, "Could not prune log file");
                } else {
                    tracing::info!(file = %name, "Pruned stale log file");
                }
            }
        }
    }
}

fn csv_row(ts: &str, status: &TargetStatus) -> String {
    let fields = [
        ts.to_string(),
        status.name.clone(),
        if status.up { "1" } else { "0" }.to_string(),
        status.code.as_str().to_string(),
        format_ms(status.tcp_ms),
        format_ms(status.tls_ms),
        format_ms(status.http_ms),
        status.note.clone().unwrap_or_default(),
    ];
    fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Two decimals, or empty when absent
pub fn format_ms(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
