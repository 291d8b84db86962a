//! Multi-sink dispatch with durable retry

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::{AgentMetrics, ControlChannel, QueueStorage, Result, TelemetrySink};
use crate::contracts::{idempotency_key, HealthPayload, QueuedEnvelope};

/// Fans payloads out to sinks and queues what nobody accepted
pub struct TelemetryManager {
    sinks: Vec<Arc<dyn TelemetrySink>>,
    queue: QueueStorage,
    metrics: Option<AgentMetrics>,
}

impl TelemetryManager {
    pub fn new(sinks: Vec<Arc<dyn TelemetrySink>>, queue: QueueStorage) -> Self {
        Self {
            sinks,
            queue,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: AgentMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn queue(&self) -> &QueueStorage {
        &self.queue
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// First sink exposing the remote control operations
    pub fn control(&self) -> Option<&dyn ControlChannel> {
        self.sinks.iter().find_map(|s| s.as_control())
    }

    /// Drain the queue, then deliver this payload; true if any sink accepted
    /// it. A payload nobody accepted is queued under its idempotency key.
    pub async fn send(
        &self,
        payload_type: &str,
        payload: &Value,
        ts: DateTime<Utc>,
        store: &str,
    ) -> bool {
        self.flush().await;

        let key = idempotency_key(payload_type, store, &ts);
        let delivered = self.deliver(payload_type, payload, &key).await;
        if !delivered {
            let envelope = QueuedEnvelope::new(payload_type, payload.clone(), key.clone());
            if let Err(e) = self.queue.save(envelope).await {
                tracing::error!(key = %key, error = %e, "Failed to queue undelivered payload");
            }
        }

        self.update_depth().await;
        delivered
    }

    pub async fn send_health(&self, payload: &HealthPayload) -> Result<bool> {
        let value = serde_json::to_value(payload)?;
        Ok(self
            .send(HealthPayload::PAYLOAD_TYPE, &value, payload.ts, &payload.store)
            .await)
    }

    /// Retry every pending envelope once, oldest first; returns how many
    /// were delivered
    pub async fn flush(&self) -> usize {
        let pending = match self.queue.pending().await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "Could not list queued envelopes");
                return 0;
            }
        };

        let mut delivered = 0;
        for path in pending {
            let envelope = match self.queue.claim(path).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not claim queued envelope");
                    continue;
                }
            };

            if self
                .deliver(&envelope.payload_type, &envelope.payload, &envelope.id)
                .await
            {
                delivered += 1;
                tracing::info!(key = %envelope.id, "Delivered queued envelope");
            } else {
                let key = envelope.id.clone();
                if let Err(e) = self.queue.save(envelope).await {
                    tracing::error!(key = %key, error = %e, "Failed to re-queue envelope");
                }
            }
        }
        delivered
    }

    /// Try every sink; errors count as declines
    async fn deliver(&self, payload_type: &str, payload: &Value, key: &str) -> bool {
        let mut accepted_any = false;
        for sink in &self.sinks {
            let accepted = match sink.send(payload_type, payload, key).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(sink = sink.name(), key, error = %e, "Sink send failed");
                    false
                }
            };
            if let Some(metrics) = &self.metrics {
                metrics.record_delivery(sink.name(), accepted);
            }
            accepted_any |= accepted;
        }
        accepted_any
    }

    async fn update_depth(&self) {
        if let Some(metrics) = &self.metrics {
            if let Ok(depth) = self.queue.pending_count().await {
                metrics.set_queue_depth(depth);
            }
        }
    }
}
