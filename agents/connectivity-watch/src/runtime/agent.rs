//! Connectivity agent: probe, log, dispatch

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::{AgentHooks, LocalStatusFile, StatusProjection, StatusSnapshot};
use crate::config::AgentConfig;
use crate::contracts::{HealthPayload, TriggerState};
use crate::delta::DeltaLogger;
use crate::engine::ProbeEngine;
use crate::policy::CadencePolicy;
use crate::telemetry::{build_sinks, AgentMetrics, QueueStorage, TelemetryManager};

pub struct ConnectivityAgent {
    config: AgentConfig,
    engine: ProbeEngine,
    logger: DeltaLogger,
    telemetry: TelemetryManager,
    policy: CadencePolicy,
    projection: Box<dyn StatusProjection>,
    last_failure: Option<String>,
    last_upload: Option<DateTime<Utc>>,
}

impl ConnectivityAgent {
    pub fn new(
        config: AgentConfig,
        engine: ProbeEngine,
        telemetry: TelemetryManager,
        projection: Box<dyn StatusProjection>,
    ) -> Self {
        let logger = DeltaLogger::new(
            config.store_id.clone(),
            config.cadence.heartbeat,
            config.paths.log_dir(),
            config.log_prefix.clone(),
        );
        let policy = CadencePolicy::new(config.cadence.clone(), config.store_id.clone());

        Self {
            config,
            engine,
            logger,
            telemetry,
            policy,
            projection,
            last_failure: None,
            last_upload: None,
        }
    }

    /// Wire every component from configuration
    pub fn from_config(config: AgentConfig, metrics: AgentMetrics) -> Self {
        let queue_dir = config.paths.queue_dir();
        let engine = ProbeEngine::new(config.probe_concurrency).with_metrics(metrics.clone());
        let telemetry = TelemetryManager::new(
            build_sinks(&config.telemetry, &queue_dir),
            QueueStorage::new(queue_dir),
        )
        .with_metrics(metrics.clone());
        let projection = Box::new(LocalStatusFile::new(config.paths.ui_dir()));
        let logger = DeltaLogger::new(
            config.store_id.clone(),
            config.cadence.heartbeat,
            config.paths.log_dir(),
            config.log_prefix.clone(),
        )
        .with_metrics(metrics);

        Self::new(config, engine, telemetry, projection).with_logger(logger)
    }

    pub fn with_logger(mut self, logger: DeltaLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &TelemetryManager {
        &self.telemetry
    }

    pub fn policy(&self) -> &CadencePolicy {
        &self.policy
    }

    pub fn last_failure(&self) -> Option<&str> {
        self.last_failure.as_deref()
    }

    pub fn last_upload(&self) -> Option<DateTime<Utc>> {
        self.last_upload
    }

    /// Probe, record the delta, and upload when forced or when the delta
    /// logger considers the snapshot worth emitting
    pub async fn gather_and_send(&mut self, now: DateTime<Utc>, force_upload: bool) -> HealthPayload {
        let statuses = self.engine.probe_all(&self.config.targets).await;
        let payload = HealthPayload::new(now, self.config.store_id.clone(), statuses);

        let should_upload = force_upload || self.logger.should_emit(&payload.targets, now);
        if let Err(e) = self.logger.record(&payload) {
            tracing::warn!(error = %e, "Failed to write delta log");
        }

        if should_upload {
            match self.telemetry.send_health(&payload).await {
                Ok(true) => self.last_upload = Some(Utc::now()),
                Ok(false) => tracing::warn!(store = %payload.store, "Health payload queued for retry"),
                Err(e) => tracing::error!(error = %e, "Could not encode health payload"),
            }
        }

        self.last_failure = payload.first_failure();
        let snapshot =
            StatusSnapshot::from_statuses(&payload.targets, self.last_failure.clone(), self.last_upload);
        self.projection.publish(&snapshot);

        tracing::info!(
            store = %payload.store,
            all_up = payload.all_up(),
            uploaded = should_upload,
            last_failure = ?self.last_failure,
            "Probe round finished"
        );
        payload
    }

    /// Poll the remote refresh flag when due; true when a refresh ran
    async fn maybe_refresh(&mut self, now: DateTime<Utc>) -> bool {
        if self.telemetry.control().is_none() || !self.policy.should_poll_refresh_trigger(now) {
            return false;
        }
        let requested = match self.telemetry.control() {
            Some(control) => control.check_trigger(&self.config.store_id).await,
            None => false,
        };
        if requested {
            tracing::info!(store = %self.config.store_id, "Remote refresh requested");
            self.gather_and_send(Utc::now(), true).await;
        }
        requested
    }

    async fn maybe_update_watchlist(&mut self, now: DateTime<Utc>) {
        if !self.policy.should_poll_watchlist(now) {
            return;
        }
        if let Some(control) = self.telemetry.control() {
            let watchlist = control.fetch_watchlist().await;
            self.policy.update_watchlist(&watchlist, now);
        }
    }
}

#[async_trait]
impl AgentHooks for ConnectivityAgent {
    async fn on_startup(&mut self) {
        let replayed = self.telemetry.flush().await;
        tracing::info!(
            store = %self.config.store_id,
            targets = self.config.targets.len(),
            sinks = ?self.telemetry.sink_names(),
            replayed,
            "Connectivity agent started"
        );
    }

    async fn on_send_now(&mut self) {
        self.gather_and_send(Utc::now(), true).await;
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>, _triggers: &TriggerState) {
        let mut now = now;
        if self.maybe_refresh(now).await {
            now = Utc::now();
        }
        self.maybe_update_watchlist(now).await;
        self.gather_and_send(now, false).await;
        self.policy.clear_expired(Utc::now());
    }

    async fn next_interval(&mut self, now: DateTime<Utc>, _triggers: &TriggerState) -> Duration {
        self.policy.cadence_for(now)
    }

    fn projection(&mut self) -> &mut dyn StatusProjection {
        self.projection.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RemoteConfig, SinkKind, TelemetrySettings};
    use crate::contracts::TargetSpec;
    use crate::engine::StaticNeighborTable;
    use crate::telemetry::TelemetrySink;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_in(dir: &std::path::Path, port: u16) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.store_id = "S1".to_string();
        config.paths.data_dir = dir.join("data");
        config.paths.trigger_dir = dir.to_path_buf();
        config.targets = vec![TargetSpec::tcp("local", "127.0.0.1", port)
            .with_timeout(Duration::from_millis(500))];
        config
    }

    fn agent_with(config: AgentConfig, sinks: Vec<Arc<dyn TelemetrySink>>) -> ConnectivityAgent {
        let engine = ProbeEngine::new(1).with_neighbor_table(Arc::new(StaticNeighborTable::empty()));
        let telemetry = TelemetryManager::new(sinks, QueueStorage::new(config.paths.queue_dir()));
        let projection = Box::new(LocalStatusFile::new(config.paths.ui_dir()));
        ConnectivityAgent::new(config, engine, telemetry, projection)
    }

    #[tokio::test]
    async fn test_cycle_uploads_first_then_suppresses() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_in(dir.path(), listener.local_addr().unwrap().port());
        let sinks = build_sinks(
            &TelemetrySettings {
                sinks: vec![SinkKind::Local],
                remote: RemoteConfig::default(),
            },
            &config.paths.queue_dir(),
        );
        let sent = config.paths.queue_dir().join("sent").join("health.jsonl");
        let mut agent = agent_with(config, sinks);

        let now = Utc::now();
        agent.run_cycle(now, &TriggerState::default()).await;
        assert!(agent.last_upload().is_some());
        assert!(agent.last_failure().is_none());

        agent
            .run_cycle(now + chrono::Duration::seconds(1), &TriggerState::default())
            .await;
        // Latency differs between rounds, so the second may upload too.
        let lines = std::fs::read_to_string(&sent).unwrap();
        assert!(lines.lines().count() >= 1);
        assert_eq!(
            agent.next_interval(now, &TriggerState::default()).await,
            Duration::from_secs(3600)
        );
        drop(listener);
    }

    #[tokio::test]
    async fn test_failure_is_tracked_and_payload_queued() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = config_in(dir.path(), port);
        let mut agent = agent_with(config, Vec::new());

        let payload = agent.gather_and_send(Utc::now(), true).await;
        assert!(!payload.all_up());
        assert_eq!(agent.last_failure(), Some("local:tcp_refused"));
        assert!(agent.last_upload().is_none());
        assert_eq!(agent.telemetry().queue().pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remote_refresh_and_watchlist_are_polled() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = config_in(dir.path(), listener.local_addr().unwrap().port());

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("action", "trigger"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"refresh": true})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("action", "ack"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        let until = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        Mock::given(method("GET"))
            .and(query_param("action", "watchlist"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"S1": {"mode": "watch", "until": until}})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let remote = crate::telemetry::RemoteSink::new(&RemoteConfig {
            base_url: format!("{}/api", server.uri()),
            api_key: "k".to_string(),
            timeout_ms: 2_000,
            https_only: false,
        })
        .unwrap();
        let sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(remote)];
        let mut agent = agent_with(config, sinks);

        let now = Utc::now();
        agent.run_cycle(now, &TriggerState::default()).await;
        assert!(agent.policy().watch_mode().is_some());
        assert_eq!(
            agent.next_interval(now, &TriggerState::default()).await,
            Duration::from_secs(300)
        );
        assert!(agent.last_upload().is_some());
        drop(listener);
    }
}
