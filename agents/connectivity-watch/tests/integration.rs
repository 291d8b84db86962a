//! Integration tests for the Connectivity Watch Agent

use chrono::{DateTime, TimeZone, Utc};
use connectivity_watch::config::Cadence;
use connectivity_watch::delta::DeltaLogger;
use connectivity_watch::engine::{ProbeEngine, StaticNeighborTable};
use connectivity_watch::policy::CadencePolicy;
use connectivity_watch::runtime::TriggerReader;
use connectivity_watch::telemetry::{
    LocalFileSink, QueueStorage, RemoteSink, TelemetryManager, TelemetrySink,
};
use connectivity_watch::*;
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

fn queued_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().starts_with(QUEUED_PREFIX))
                .count()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_offline_then_online_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    let sent_dir = queue_dir.join("sent");
    std::fs::create_dir_all(&queue_dir).unwrap();

    // A plain file where the audit directory belongs makes the local sink fail.
    std::fs::write(&sent_dir, "blocked").unwrap();

    let sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(LocalFileSink::new(&sent_dir))];
    let manager = TelemetryManager::new(sinks, QueueStorage::new(&queue_dir));

    let first = json!({"store": "S1", "n": 1});
    assert!(!manager.send("health", &first, t0(), "S1").await);
    assert_eq!(queued_files(&queue_dir), 1);

    std::fs::remove_file(&sent_dir).unwrap();
    let second = json!({"store": "S1", "n": 2});
    assert!(manager.send("health", &second, t0() + chrono::Duration::minutes(5), "S1").await);

    assert_eq!(queued_files(&queue_dir), 0);
    let audit = std::fs::read_to_string(sent_dir.join("health.jsonl")).unwrap();
    let records: Vec<serde_json::Value> = audit
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["id"], "health-S1-2024-01-01T12:00:00Z");
    assert_eq!(records[0]["payload"]["n"], 1);
    assert_eq!(records[1]["id"], "health-S1-2024-01-01T12:05:00Z");
}

#[tokio::test]
async fn test_queue_dedup_same_key() {
    let dir = tempfile::tempdir().unwrap();
    let queue = QueueStorage::new(dir.path());
    let key = idempotency_key("health", "S1", &t0());

    assert!(queue
        .save(QueuedEnvelope::new("health", json!({"n": 1}), key.clone()))
        .await
        .unwrap());
    assert!(!queue
        .save(QueuedEnvelope::new("health", json!({"n": 2}), key.clone()))
        .await
        .unwrap());

    assert_eq!(queued_files(dir.path()), 1);
    let path = dir.path().join(queued_file_name(&key));
    let stored: QueuedEnvelope = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
    assert_eq!(stored.payload["n"], 1);
}

#[tokio::test]
async fn test_remote_outage_then_recovery() {
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(header("content-encoding", "gzip"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let remote = RemoteSink::new(&connectivity_watch::config::RemoteConfig {
        base_url: format!("{}/collect", server.uri()),
        api_key: "key".to_string(),
        timeout_ms: 2_000,
        https_only: false,
    })
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let sinks: Vec<Arc<dyn TelemetrySink>> = vec![Arc::new(remote)];
    let manager = TelemetryManager::new(sinks, QueueStorage::new(dir.path()));

    let payload = HealthPayload::new(t0(), "S1", vec![TargetStatus::success("gateway")]);
    assert!(!manager.send_health(&payload).await.unwrap());
    assert_eq!(queued_files(dir.path()), 1);

    let later = HealthPayload::new(
        t0() + chrono::Duration::minutes(15),
        "S1",
        vec![TargetStatus::success("gateway")],
    );
    assert!(manager.send_health(&later).await.unwrap());
    assert_eq!(queued_files(dir.path()), 0);
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[test]
fn test_trigger_consumption_is_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("SENDNOW"), "").unwrap();
    std::fs::write(dir.path().join("UNLOCK_store-7"), "").unwrap();

    let reader = TriggerReader::new(dir.path());
    let first = reader.read();
    assert!(first.send_now);
    assert_eq!(first.unlocked_token.as_deref(), Some("store-7"));

    let second = reader.read();
    assert_eq!(second, TriggerState::default());
    assert!(!dir.path().join("SENDNOW").exists());
    assert!(!dir.path().join("UNLOCK_store-7").exists());
}

#[test]
fn test_cadence_follows_watchlist_until_expiry() {
    let cadence = Cadence::default();
    let mut policy = CadencePolicy::new(cadence.clone(), "STORE-1");
    let mut watchlist = Watchlist::new();
    watchlist.insert(
        "STORE-1".to_string(),
        json!({"mode": "watch", "until": "2024-01-01T12:20:00Z"}),
    );

    policy.update_watchlist(&watchlist, t0());
    assert_eq!(policy.cadence_for(t0()), cadence.watch);

    let until = t0() + chrono::Duration::minutes(20);
    assert_eq!(policy.cadence_for(until), cadence.normal);

    policy.clear_expired(until);
    assert_eq!(policy.cadence_for(t0()), cadence.normal);
}

#[tokio::test]
async fn test_gateway_recovers_independently() {
    let isp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let public_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let gateway_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let timeout = Duration::from_millis(500);
    let targets = vec![
        TargetSpec::tcp("gateway", "127.0.0.1", gateway_port).with_timeout(timeout),
        TargetSpec::tcp("isp", "127.0.0.1", isp.local_addr().unwrap().port()).with_timeout(timeout),
        TargetSpec::tcp("public", "127.0.0.1", public_port).with_timeout(timeout),
    ];
    let engine = ProbeEngine::new(3).with_neighbor_table(Arc::new(StaticNeighborTable::empty()));

    for _ in 0..2 {
        let statuses = engine.probe_all(&targets).await;
        let gateway = &statuses[0];
        assert_eq!(gateway.name, "gateway");
        assert!(!gateway.up);
        assert!(matches!(
            gateway.code,
            ProbeCode::TcpTimeout | ProbeCode::TcpRefused
        ));
        assert!(gateway.tcp_ms.is_none());
        assert!(statuses[1].up);
        assert!(!statuses[2].up);
    }

    let _gateway = TcpListener::bind(("127.0.0.1", gateway_port)).await.unwrap();
    let statuses = engine.probe_all(&targets).await;
    assert!(statuses[0].up);
    assert_eq!(statuses[0].code, ProbeCode::Success);
    assert!(statuses[0].tcp_ms.is_some());
    assert!(statuses[1].up);
    assert!(!statuses[2].up);
}

#[tokio::test]
async fn test_delta_log_and_dispatch_share_payload() {
    let dir = tempfile::tempdir().unwrap();
    let mut logger = DeltaLogger::new("S1", Duration::from_secs(900), dir.path().join("logs"), "connwatch");
    let payload = HealthPayload::new(
        t0(),
        "S1",
        vec![
            TargetStatus::success("gateway"),
            TargetStatus::failed("isp", ProbeCode::L2PresentL3Blocked),
        ],
    );

    assert!(logger.record(&payload).unwrap());
    assert!(!logger.record(&payload).unwrap());

    let (csv, jsonl) = logger.log_paths(t0());
    let csv = std::fs::read_to_string(csv).unwrap();
    assert_eq!(csv.lines().count(), 3);
    assert!(csv.contains("isp,0,l2_present_l3_blocked"));
    let line = std::fs::read_to_string(jsonl).unwrap();
    let parsed: HealthPayload = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(parsed.targets.len(), 2);
    assert_eq!(parsed.ts, t0());
}

fn steady_statuses() -> Vec<TargetStatus> {
    let mut gateway = TargetStatus::success("gateway");
    gateway.tcp_ms = Some(1.25);
    vec![gateway, TargetStatus::failed("public", ProbeCode::TcpTimeout)]
}

proptest! {
    #[test]
    fn prop_unchanged_statuses_are_suppressed(offsets in prop::collection::vec(0i64..900, 1..16)) {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DeltaLogger::new("S1", Duration::from_secs(900), dir.path(), "p");
        logger.record(&HealthPayload::new(t0(), "S1", steady_statuses())).unwrap();

        for offset in offsets {
            let now = t0() + chrono::Duration::seconds(offset);
            prop_assert!(!logger.should_emit(&steady_statuses(), now));
        }
    }

    #[test]
    fn prop_heartbeat_forces_emission(extra in 0i64..86_400) {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = DeltaLogger::new("S1", Duration::from_secs(900), dir.path(), "p");
        logger.record(&HealthPayload::new(t0(), "S1", steady_statuses())).unwrap();

        let now = t0() + chrono::Duration::seconds(900 + extra);
        prop_assert!(logger.should_emit(&steady_statuses(), now));
    }
}
