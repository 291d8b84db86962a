//! Probe engine
//!
//! Runs one connectivity check per target under a fixed permit count, so a
//! slow or unreachable host cannot starve the others. Results come back in
//! input order and every error path resolves to a [`TargetStatus`].

mod checkers;
mod neighbor;

pub use checkers::*;
pub use neighbor::*;

use crate::contracts::*;
use crate::telemetry::metrics::AgentMetrics;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_rustls::TlsConnector;

/// Default number of probes in flight
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Connectivity probe engine
pub struct ProbeEngine {
    permits: Arc<Semaphore>,
    concurrency: usize,
    tls: TlsConnector,
    neighbors: Arc<dyn NeighborTable>,
    metrics: Option<AgentMetrics>,
}

impl Default for ProbeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl ProbeEngine {
    /// Create an engine using the system neighbor table and webpki roots
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            tls: default_tls_connector(),
            neighbors: Arc::new(SystemNeighborTable),
            metrics: None,
        }
    }

    /// Replace the neighbor-table lookup
    pub fn with_neighbor_table(mut self, neighbors: Arc<dyn NeighborTable>) -> Self {
        self.neighbors = neighbors;
        self
    }

    /// Replace the TLS connector (custom roots)
    pub fn with_tls_connector(mut self, tls: TlsConnector) -> Self {
        self.tls = tls;
        self
    }

    /// Count outcomes in a metrics registry
    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Probe every target; one status per target, in input order
    pub async fn probe_all(&self, targets: &[TargetSpec]) -> Vec<TargetStatus> {
        let probes = targets.iter().map(|target| self.probe_with_permit(target));
        let statuses = futures::future::join_all(probes).await;

        if let Some(metrics) = &self.metrics {
            for status in &statuses {
                metrics.record_probe(status.code);
            }
        }

        statuses
    }

    /// Probe a single target
    pub async fn probe(&self, target: &TargetSpec) -> TargetStatus {
        self.probe_with_permit(target).await
    }

    async fn probe_with_permit(&self, target: &TargetSpec) -> TargetStatus {
        // The semaphore is never closed; a failed acquire still yields a status.
        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                return TargetStatus::failed(&target.name, ProbeCode::Unknown)
                    .with_note(e.to_string())
            }
        };

        let status = probe_target(target, &self.tls, self.neighbors.as_ref()).await;
        tracing::debug!(
            target = %status.name,
            up = status.up,
            code = %status.code,
            tcp_ms = ?status.tcp_ms,
            http_ms = ?status.http_ms,
            "Probe finished"
        );
        status
    }
}
