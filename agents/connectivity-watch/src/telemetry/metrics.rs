//! Prometheus counters for the agent
//!
//! - `connwatch_probes_total` (counter) - probe outcomes by code
//! - `connwatch_deliveries_total` (counter) - sink deliveries by sink and result
//! - `connwatch_delta_emissions_total` (counter) - delta log writes
//! - `connwatch_queue_depth` (gauge) - envelopes pending on disk
//!
//! Rendered on demand; there is no scrape endpoint.

use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use super::{Result, TelemetryError};
use crate::contracts::ProbeCode;

const NAMESPACE: &str = "connwatch";

/// Shared handle to the agent's metrics; clones share one registry
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Arc<Registry>,
    probes_total: CounterVec,
    deliveries_total: CounterVec,
    emissions_total: Counter,
    queue_depth: Gauge,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let probes_total = CounterVec::new(
            Opts::new("probes_total", "Probe outcomes by status code").namespace(NAMESPACE),
            &["code"],
        )?;
        registry.register(Box::new(probes_total.clone()))?;

        let deliveries_total = CounterVec::new(
            Opts::new("deliveries_total", "Sink delivery attempts by sink and result")
                .namespace(NAMESPACE),
            &["sink", "result"],
        )?;
        registry.register(Box::new(deliveries_total.clone()))?;

        let emissions_total = Counter::with_opts(
            Opts::new("delta_emissions_total", "Delta log writes").namespace(NAMESPACE),
        )?;
        registry.register(Box::new(emissions_total.clone()))?;

        let queue_depth = Gauge::with_opts(
            Opts::new("queue_depth", "Envelopes pending in the durable queue")
                .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            probes_total,
            deliveries_total,
            emissions_total,
            queue_depth,
        })
    }

    pub fn record_probe(&self, code: ProbeCode) {
        self.probes_total.with_label_values(&[code.as_str()]).inc();
    }

    pub fn record_delivery(&self, sink: &str, accepted: bool) {
        let result = if accepted { "accepted" } else { "declined" };
        self.deliveries_total.with_label_values(&[sink, result]).inc();
    }

    pub fn record_emission(&self) {
        self.emissions_total.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Config(e.to_string()))
    }
}
