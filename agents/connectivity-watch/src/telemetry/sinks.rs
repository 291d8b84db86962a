//! Telemetry sink implementations

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{ControlChannel, Result, TelemetryError, TelemetrySink};
use crate::config::{RemoteConfig, SinkKind, TelemetrySettings};
use crate::contracts::Watchlist;

const API_KEY_HEADER: &str = "X-Api-Key";
const IDEMPOTENCY_HEADER: &str = "X-Idempotency-Key";

/// Build the configured sinks, in order. A remote sink that cannot be
/// constructed is skipped with a warning.
pub fn build_sinks(settings: &TelemetrySettings, queue_dir: &Path) -> Vec<Arc<dyn TelemetrySink>> {
    let mut sinks: Vec<Arc<dyn TelemetrySink>> = Vec::new();
    for kind in &settings.sinks {
        match kind {
            SinkKind::Local => sinks.push(Arc::new(LocalFileSink::new(queue_dir.join("sent")))),
            SinkKind::Remote => match RemoteSink::new(&settings.remote) {
                Ok(remote) => sinks.push(Arc::new(remote)),
                Err(e) => {
                    tracing::warn!(error = %e, "Remote sink disabled");
                }
            },
            SinkKind::Placeholder => sinks.push(Arc::new(PlaceholderSink)),
        }
    }
    sinks
}

/// Appends `{id, payload}` lines to `<dir>/<type>.jsonl`
#[derive(Debug, Clone)]
pub struct LocalFileSink {
    dir: PathBuf,
}

impl LocalFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, payload_type: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", payload_type))
    }
}

#[async_trait]
impl TelemetrySink for LocalFileSink {
    fn name(&self) -> &str {
        "local"
    }

    async fn send(&self, payload_type: &str, payload: &Value, idempotency_key: &str) -> Result<bool> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_string(&json!({
            "id": idempotency_key,
            "payload": payload,
        }))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(payload_type))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(true)
    }
}

/// Accepts everything without I/O
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderSink;

#[async_trait]
impl TelemetrySink for PlaceholderSink {
    fn name(&self) -> &str {
        "placeholder"
    }

    async fn send(&self, payload_type: &str, _payload: &Value, idempotency_key: &str) -> Result<bool> {
        tracing::trace!(payload_type, key = idempotency_key, "Placeholder sink accepted payload");
        Ok(true)
    }
}

/// Remote collector over HTTPS
pub struct RemoteSink {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteSink {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(TelemetryError::Config("remote base_url is empty".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .https_only(config.https_only)
            .user_agent(concat!("connectivity-watch/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json(&self, query: &[(&str, &str)]) -> Result<Value> {
        let response = self
            .client
            .get(&self.base_url)
            .query(query)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(TelemetryError::Status(status.as_u16()));
        }

        let gzipped = response
            .headers()
            .get(reqwest::header::CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("gzip"))
            .unwrap_or(false);
        let body = response.bytes().await?;
        let body = if gzipped { gunzip(&body)? } else { body.to_vec() };

        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl TelemetrySink for RemoteSink {
    fn name(&self) -> &str {
        "remote"
    }

    async fn send(&self, payload_type: &str, payload: &Value, idempotency_key: &str) -> Result<bool> {
        let body = serde_json::to_vec(&json!({
            "type": payload_type,
            "id": idempotency_key,
            "payload": payload,
        }))?;
        let compressed = gzip(&body)?;

        let response = self
            .client
            .post(&self.base_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(reqwest::header::CONTENT_ENCODING, "gzip")
            .header(API_KEY_HEADER, &self.api_key)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .body(compressed)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), key = idempotency_key, "Collector rejected payload");
        }
        Ok(status.is_success())
    }

    fn as_control(&self) -> Option<&dyn ControlChannel> {
        Some(self)
    }
}

#[async_trait]
impl ControlChannel for RemoteSink {
    async fn check_trigger(&self, store: &str) -> bool {
        let requested = match self.get_json(&[("action", "trigger"), ("store", store)]).await {
            Ok(body) => body.get("refresh").and_then(Value::as_bool).unwrap_or(false),
            Err(e) => {
                tracing::debug!(error = %e, "Refresh trigger poll failed");
                false
            }
        };

        if requested {
            if let Err(e) = self.get_json(&[("action", "ack"), ("store", store)]).await {
                tracing::warn!(store, error = %e, "Failed to acknowledge refresh trigger");
            }
        }
        requested
    }

    async fn fetch_watchlist(&self) -> Watchlist {
        match self.get_json(&[("action", "watchlist")]).await {
            Ok(Value::Object(map)) => map.into_iter().collect(),
            Ok(_) => {
                tracing::debug!("Watchlist response is not an object");
                Watchlist::new()
            }
            Err(e) => {
                tracing::debug!(error = %e, "Watchlist fetch failed");
                Watchlist::new()
            }
        }
    }
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| TelemetryError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| TelemetryError::Compression(e.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| TelemetryError::Compression(e.to_string()))?;
    Ok(decoded)
}
