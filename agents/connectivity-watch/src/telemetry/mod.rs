//! Telemetry dispatch for the Connectivity Watch Agent
//!
//! Payloads go out through every configured sink; when none accepts, the
//! payload is kept in a durable on-disk queue and replayed before the next
//! send. Delivery is at-least-once, with an idempotency key forwarded to
//! every sink so downstream collectors can deduplicate.
//!
//! - [`TelemetrySink`]: one delivery channel
//! - [`ControlChannel`]: remote-only trigger and watchlist queries
//! - [`QueueStorage`]: pending envelopes on disk
//! - [`TelemetryManager`]: drain, fan out, queue on failure

use async_trait::async_trait;
use thiserror::Error;

use crate::contracts::Watchlist;

mod dispatcher;
pub mod metrics;
mod queue;
mod sinks;

pub use dispatcher::TelemetryManager;
pub use metrics::AgentMetrics;
pub use queue::QueueStorage;
pub use sinks::{build_sinks, LocalFileSink, PlaceholderSink, RemoteSink};

/// Errors raised inside the telemetry pipeline
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Failed to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, TelemetryError>;

/// A delivery channel for telemetry payloads
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    /// Deliver one payload; `Ok(true)` means accepted. An `Err` is treated
    /// as a decline by the dispatcher.
    async fn send(
        &self,
        payload_type: &str,
        payload: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<bool>;

    /// Capability query for the remote control operations
    fn as_control(&self) -> Option<&dyn ControlChannel> {
        None
    }
}

/// Non-telemetry queries served by the remote collector
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Whether a refresh was requested for `store`; acknowledges it when set
    async fn check_trigger(&self, store: &str) -> bool;

    /// Per-store watch overrides; empty on any failure
    async fn fetch_watchlist(&self) -> Watchlist;
}
