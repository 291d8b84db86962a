//! Connectivity Watch Contracts
//!
//! Plain data describing what to probe, the outcome of a probe, and the
//! persisted units exchanged with the telemetry pipeline.

mod envelope;
mod watch;

pub use envelope::*;
pub use watch::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A named host/port/protocol combination to be health-checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Unique target name
    pub name: String,

    /// Hostname or IP address
    pub host: String,

    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Perform a TLS handshake after connecting
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,

    /// Issue a HEAD request for this path once connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_path: Option<String>,

    /// SNI override (defaults to `host`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    /// Per-phase timeout, in seconds on the wire
    #[serde(default = "default_timeout", with = "secs_f64")]
    pub timeout: Duration,
}

fn default_port() -> u16 {
    443
}

fn default_use_tls() -> bool {
    true
}

fn default_timeout() -> Duration {
    Duration::from_secs(3)
}

impl TargetSpec {
    /// Plain TCP target with default timeout
    pub fn tcp(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            use_tls: false,
            http_path: None,
            sni: None,
            timeout: default_timeout(),
        }
    }

    /// TLS target with default timeout
    pub fn tls(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            use_tls: true,
            ..Self::tcp(name, host, port)
        }
    }

    /// Add an HTTP HEAD path
    pub fn with_http_path(mut self, path: impl Into<String>) -> Self {
        self.http_path = Some(path.into());
        self
    }

    /// Override the SNI / Host header name
    pub fn with_sni(mut self, sni: impl Into<String>) -> Self {
        self.sni = Some(sni.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Name presented during the handshake and in the Host header
    pub fn server_name(&self) -> &str {
        self.sni.as_deref().unwrap_or(&self.host)
    }
}

/// Classification of a probe outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeCode {
    Success,
    TcpTimeout,
    TcpRefused,
    TlsFail,
    #[serde(rename = "http_4xx")]
    Http4xx,
    #[serde(rename = "http_5xx")]
    Http5xx,
    #[serde(rename = "l2_present_l3_blocked")]
    L2PresentL3Blocked,
    Unknown,
}

impl ProbeCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeCode::Success => "success",
            ProbeCode::TcpTimeout => "tcp_timeout",
            ProbeCode::TcpRefused => "tcp_refused",
            ProbeCode::TlsFail => "tls_fail",
            ProbeCode::Http4xx => "http_4xx",
            ProbeCode::Http5xx => "http_5xx",
            ProbeCode::L2PresentL3Blocked => "l2_present_l3_blocked",
            ProbeCode::Unknown => "unknown",
        }
    }

    /// Failures that warrant a neighbor-table check
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ProbeCode::TcpTimeout | ProbeCode::TcpRefused | ProbeCode::TlsFail
        )
    }
}

impl fmt::Display for ProbeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one probe against one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    /// Target name
    pub name: String,

    /// Reachability verdict
    pub up: bool,

    /// Outcome classification
    pub code: ProbeCode,

    /// Connect (and TLS handshake) latency
    pub tcp_ms: Option<f64>,

    /// TLS latency; equals `tcp_ms` on TLS targets
    pub tls_ms: Option<f64>,

    /// HEAD request latency
    pub http_ms: Option<f64>,

    /// Certificate details or error text
    pub note: Option<String>,
}

impl TargetStatus {
    /// Status with no timings
    pub fn new(name: impl Into<String>, up: bool, code: ProbeCode) -> Self {
        Self {
            name: name.into(),
            up,
            code,
            tcp_ms: None,
            tls_ms: None,
            http_ms: None,
            note: None,
        }
    }

    pub fn success(name: impl Into<String>) -> Self {
        Self::new(name, true, ProbeCode::Success)
    }

    pub fn failed(name: impl Into<String>, code: ProbeCode) -> Self {
        Self::new(name, false, code)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Field-by-field comparison used for delta detection
    pub fn differs_from(&self, other: &TargetStatus) -> bool {
        self.up != other.up
            || self.code != other.code
            || self.tcp_ms != other.tcp_ms
            || self.tls_ms != other.tls_ms
            || self.http_ms != other.http_ms
            || self.note != other.note
    }
}

/// One cycle's worth of statuses for a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPayload {
    /// Cycle timestamp
    pub ts: DateTime<Utc>,

    /// Store identifier
    pub store: String,

    /// Statuses in target order
    pub targets: Vec<TargetStatus>,
}

impl HealthPayload {
    /// Payload type tag used for telemetry
    pub const PAYLOAD_TYPE: &'static str = "health";

    pub fn new(ts: DateTime<Utc>, store: impl Into<String>, targets: Vec<TargetStatus>) -> Self {
        Self {
            ts,
            store: store.into(),
            targets,
        }
    }

    /// First target that is down, as `name:code`
    pub fn first_failure(&self) -> Option<String> {
        self.targets
            .iter()
            .find(|t| !t.up)
            .map(|t| format!("{}:{}", t.name, t.code))
    }

    pub fn all_up(&self) -> bool {
        self.targets.iter().all(|t| t.up)
    }
}

/// Durations expressed as fractional seconds
pub mod secs_f64 {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!("invalid duration: {} seconds", secs))
        })
    }
}
