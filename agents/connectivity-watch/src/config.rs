//! Agent configuration
//!
//! Loaded from a JSON or YAML file with per-field fallbacks, then overlaid with
//! environment variables. A file that exists but cannot be parsed is copied to
//! `<name>.fixme.json` and the defaults are used instead.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::contracts::TargetSpec;
use crate::error::{AgentError, Result};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "connwatch.json";

/// Fallback store identifier
pub const UNKNOWN_STORE: &str = "UNKNOWN-STORE";

/// Polling and heartbeat intervals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cadence {
    pub normal: Duration,
    pub watch: Duration,
    pub heartbeat: Duration,
    pub refresh_poll: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            normal: Duration::from_secs(60 * 60),
            watch: Duration::from_secs(5 * 60),
            heartbeat: Duration::from_secs(15 * 60),
            refresh_poll: Duration::from_secs(45),
        }
    }
}

/// Remote collector settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
    /// Refuse plain-HTTP endpoints
    pub https_only: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "https://collector.invalid/api/telemetry".to_string(),
            api_key: "demo-key".to_string(),
            timeout_ms: 10_000,
            https_only: true,
        }
    }
}

/// Configured sink kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Local,
    Remote,
    Placeholder,
}

impl SinkKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "local" => Some(SinkKind::Local),
            "remote" => Some(SinkKind::Remote),
            "placeholder" => Some(SinkKind::Placeholder),
            _ => None,
        }
    }
}

/// Telemetry dispatch settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetrySettings {
    pub sinks: Vec<SinkKind>,
    pub remote: RemoteConfig,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            sinks: vec![SinkKind::Local, SinkKind::Remote, SinkKind::Placeholder],
            remote: RemoteConfig::default(),
        }
    }
}

/// On-disk locations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub trigger_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            trigger_dir: PathBuf::from("."),
        }
    }
}

impl PathsConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn ui_dir(&self) -> PathBuf {
        self.data_dir.join("ui")
    }
}

/// Complete agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub store_id: String,
    pub targets: Vec<TargetSpec>,
    pub cadence: Cadence,
    pub telemetry: TelemetrySettings,
    pub paths: PathsConfig,
    pub probe_concurrency: usize,
    pub log_prefix: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            store_id: default_store_id(),
            targets: default_targets(),
            cadence: Cadence::default(),
            telemetry: TelemetrySettings::default(),
            paths: PathsConfig::default(),
            probe_concurrency: 3,
            log_prefix: "connwatch".to_string(),
        }
    }
}

/// gateway / isp / public over plain TCP
pub fn default_targets() -> Vec<TargetSpec> {
    vec![
        TargetSpec::tcp("gateway", "192.168.1.1", 443),
        TargetSpec::tcp("isp", "8.8.4.4", 443),
        TargetSpec::tcp("public", "8.8.8.8", 443),
    ]
}

fn default_store_id() -> String {
    let from_env = ["STORE_ID", "HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|v| !v.trim().is_empty());

    from_env
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|v| v.trim().to_uppercase())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| UNKNOWN_STORE.to_string())
}

// Raw, lenient view of the file. Every section is optional.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    store_id: Option<String>,
    #[serde(default)]
    targets: Vec<serde_json::Value>,
    #[serde(default)]
    cadence: Option<serde_json::Value>,
    #[serde(default)]
    telemetry: Option<RawTelemetry>,
    #[serde(default)]
    paths: Option<RawPaths>,
    #[serde(default)]
    probe: Option<RawProbe>,
    #[serde(default)]
    log_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTelemetry {
    #[serde(default)]
    sinks: Option<Vec<String>>,
    #[serde(default)]
    remote: Option<RawRemote>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRemote {
    base_url: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
    https_only: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPaths {
    data_dir: Option<PathBuf>,
    trigger_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawProbe {
    concurrency: Option<usize>,
}

impl AgentConfig {
    /// Load from `path`, falling back to defaults when it is missing or broken
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut config = if path.exists() {
            match Self::from_file(path) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Configuration unreadable, using defaults"
                    );
                    preserve_broken_file(path);
                    Self::default()
                }
            }
        } else {
            tracing::info!(path = %path.display(), "No configuration file, using defaults");
            Self::default()
        };
        config.apply_env();
        config
    }

    /// Parse a JSON or YAML file, chosen by extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if is_yaml {
            Self::from_yaml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(content)?;
        Ok(Self::from_raw(raw))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(content)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let defaults = Self::default();

        let store_id = raw
            .store_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.store_id);

        let targets: Vec<TargetSpec> = raw
            .targets
            .into_iter()
            .filter_map(|value| match serde_json::from_value::<TargetSpec>(value) {
                Ok(spec) => Some(spec),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed target");
                    None
                }
            })
            .collect();
        let targets = if targets.is_empty() {
            defaults.targets
        } else {
            targets
        };

        let cadence = raw
            .cadence
            .map(|value| parse_cadence(&value))
            .unwrap_or(defaults.cadence);

        let telemetry = raw
            .telemetry
            .map(parse_telemetry)
            .unwrap_or(defaults.telemetry);

        let paths = raw
            .paths
            .map(|p| PathsConfig {
                data_dir: p.data_dir.unwrap_or(defaults.paths.data_dir.clone()),
                trigger_dir: p.trigger_dir.unwrap_or(defaults.paths.trigger_dir.clone()),
            })
            .unwrap_or(defaults.paths);

        let probe_concurrency = raw
            .probe
            .and_then(|p| p.concurrency)
            .filter(|c| *c > 0)
            .unwrap_or(defaults.probe_concurrency);

        let log_prefix = raw
            .log_prefix
            .filter(|p| !p.trim().is_empty())
            .unwrap_or(defaults.log_prefix);

        Self {
            store_id,
            targets,
            cadence,
            telemetry,
            paths,
            probe_concurrency,
            log_prefix,
        }
    }

    /// Overlay `CONNWATCH_*` environment variables
    pub fn apply_env(&mut self) {
        if let Some(store) = env_non_empty("CONNWATCH_STORE_ID") {
            self.store_id = store;
        }
        if let Some(url) = env_non_empty("CONNWATCH_REMOTE_URL") {
            self.telemetry.remote.base_url = url;
        }
        if let Some(key) = env_non_empty("CONNWATCH_API_KEY") {
            self.telemetry.remote.api_key = key;
        }
    }

    /// Create log, queue and ui directories
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.paths.data_dir.clone(),
            self.paths.log_dir(),
            self.paths.queue_dir(),
            self.paths.ui_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                AgentError::config(format!("cannot create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_telemetry(raw: RawTelemetry) -> TelemetrySettings {
    let defaults = TelemetrySettings::default();

    let sinks = match raw.sinks {
        Some(names) => names
            .iter()
            .filter_map(|name| {
                let kind = SinkKind::parse(name);
                if kind.is_none() {
                    tracing::warn!(sink = %name, "Unknown sink kind, skipping");
                }
                kind
            })
            .collect(),
        None => defaults.sinks,
    };

    let remote = match raw.remote {
        Some(r) => RemoteConfig {
            base_url: r
                .base_url
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.remote.base_url),
            api_key: r
                .api_key
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.remote.api_key),
            timeout_ms: r.timeout_ms.unwrap_or(defaults.remote.timeout_ms),
            https_only: r.https_only.unwrap_or(defaults.remote.https_only),
        },
        None => defaults.remote,
    };

    TelemetrySettings { sinks, remote }
}

fn parse_cadence(value: &serde_json::Value) -> Cadence {
    let defaults = Cadence::default();
    let field = |name: &str, default: Duration| {
        value
            .get(name)
            .map(|v| parse_duration(v, default))
            .unwrap_or(default)
    };
    Cadence {
        normal: field("normal", defaults.normal),
        watch: field("watch", defaults.watch),
        heartbeat: field("heartbeat", defaults.heartbeat),
        refresh_poll: field("refresh_poll", defaults.refresh_poll),
    }
}

/// Shortest accepted cadence interval; the loop always sleeps at least this long
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// A number of seconds, or `{"seconds": n}`
fn parse_duration(value: &serde_json::Value, default: Duration) -> Duration {
    let secs = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Object(map) => map.get("seconds").and_then(|s| s.as_f64()),
        _ => None,
    };
    match secs.map(Duration::try_from_secs_f64) {
        Some(Ok(duration)) => duration.max(MIN_INTERVAL),
        _ => default,
    }
}

fn preserve_broken_file(path: &Path) {
    let fixme = path.with_extension("fixme.json");
    if let Err(e) = std::fs::copy(path, &fixme) {
        tracing::warn!(error = %e, "Could not preserve broken configuration");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.targets.len(), 3);
        assert_eq!(config.targets[0].name, "gateway");
        assert!(!config.targets[0].use_tls);
        assert_eq!(config.cadence.normal, Duration::from_secs(3600));
        assert_eq!(config.cadence.refresh_poll, Duration::from_secs(45));
        assert_eq!(config.probe_concurrency, 3);
        assert!(!config.store_id.is_empty());
    }

    #[test]
    fn test_parse_full_json() {
        let config = AgentConfig::from_json_str(
            r#"{
                "store_id": " S042 ",
                "targets": [
                    {"name": "gateway", "host": "10.0.0.1", "port": 80, "use_tls": false},
                    {"name": "broken"},
                    {"name": "public", "host": "example.com", "http_path": "/", "timeout": 2}
                ],
                "cadence": {"normal": 600, "watch": {"seconds": 60}, "heartbeat": "bad"},
                "telemetry": {"sinks": ["local", "nope", "remote"], "remote": {"api_key": "k1"}},
                "probe": {"concurrency": 5}
            }"#,
        )
        .unwrap();

        assert_eq!(config.store_id, "S042");
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[1].timeout, Duration::from_secs(2));
        assert_eq!(config.cadence.normal, Duration::from_secs(600));
        assert_eq!(config.cadence.watch, Duration::from_secs(60));
        assert_eq!(config.cadence.heartbeat, Cadence::default().heartbeat);
        assert_eq!(config.telemetry.sinks, vec![SinkKind::Local, SinkKind::Remote]);
        assert_eq!(config.telemetry.remote.api_key, "k1");
        assert!(config.telemetry.remote.https_only);
        assert_eq!(config.probe_concurrency, 5);
    }

    #[test]
    fn test_parse_yaml() {
        let config = AgentConfig::from_yaml_str(
            "store_id: S7\ntargets:\n  - name: isp\n    host: 8.8.4.4\n    use_tls: false\n",
        )
        .unwrap();
        assert_eq!(config.store_id, "S7");
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].port, 443);
    }

    #[test]
    fn test_empty_targets_fall_back() {
        let config = AgentConfig::from_json_str(r#"{"targets": []}"#).unwrap();
        assert_eq!(config.targets, default_targets());
    }

    #[test]
    fn test_broken_file_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connwatch.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = AgentConfig::load(&path);
        assert_eq!(config.targets, default_targets());
        assert!(dir.path().join("connwatch.fixme.json").exists());
    }

    #[test]
    fn test_ensure_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::default();
        config.paths.data_dir = dir.path().join("data");
        config.ensure_dirs().unwrap();
        assert!(config.paths.log_dir().is_dir());
        assert!(config.paths.queue_dir().is_dir());
        assert!(config.paths.ui_dir().is_dir());
    }

    #[test]
    fn test_oversized_durations_fall_back() {
        let config = AgentConfig::from_json_str(
            r#"{
                "cadence": {"normal": 1e300, "watch": -5, "heartbeat": {"seconds": 1e300}},
                "targets": [
                    {"name": "huge", "host": "10.0.0.1", "timeout": 1e300},
                    {"name": "isp", "host": "8.8.8.8", "use_tls": false, "port": 53}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(config.cadence, Cadence::default());
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].name, "isp");
    }

    #[test]
    fn test_zero_cadence_is_clamped() {
        let config =
            AgentConfig::from_json_str(r#"{"cadence": {"normal": 0, "watch": 0.25}}"#).unwrap();
        assert_eq!(config.cadence.normal, MIN_INTERVAL);
        assert_eq!(config.cadence.watch, MIN_INTERVAL);
        assert_eq!(config.cadence.heartbeat, Cadence::default().heartbeat);
    }

    #[test]
    fn test_sink_kind_parse() {
        assert_eq!(SinkKind::parse("Local"), Some(SinkKind::Local));
        assert_eq!(SinkKind::parse(" remote "), Some(SinkKind::Remote));
        assert_eq!(SinkKind::parse("other"), None);
    }
}
