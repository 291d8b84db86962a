//! Agent scheduling loop
//!
//! One cooperative iteration per cycle: consume filesystem triggers, sync the
//! status projection's lock state, run the agent's hooks, then sleep for the
//! interval the agent asks for. The loop never ends on its own; callers stop
//! it by dropping the future (e.g. racing it against a shutdown signal).

mod agent;
mod projection;
mod triggers;

pub use agent::ConnectivityAgent;
pub use projection::{LocalStatusFile, StatusColor, StatusProjection, StatusSnapshot};
pub use triggers::{TriggerReader, SEND_NOW_FILE, UNLOCK_PREFIX};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::contracts::TriggerState;

/// Extension points the loop drives
#[async_trait]
pub trait AgentHooks: Send {
    /// Runs once before the first cycle
    async fn on_startup(&mut self) {}

    /// Runs when a send-now marker was consumed
    async fn on_send_now(&mut self) {}

    /// Periodic work for one cycle
    async fn run_cycle(&mut self, now: DateTime<Utc>, triggers: &TriggerState);

    /// Sleep before the next cycle
    async fn next_interval(&mut self, now: DateTime<Utc>, triggers: &TriggerState) -> Duration;

    /// Lock-gated status view maintained by the loop
    fn projection(&mut self) -> &mut dyn StatusProjection;
}

pub struct AgentLoop<H> {
    hooks: H,
    triggers: TriggerReader,
    started: bool,
}

impl<H: AgentHooks> AgentLoop<H> {
    pub fn new(hooks: H, triggers: TriggerReader) -> Self {
        Self {
            hooks,
            triggers,
            started: false,
        }
    }

    pub fn hooks(&self) -> &H {
        &self.hooks
    }

    /// One iteration without the sleep; returns the interval to wait
    pub async fn run_once(&mut self) -> Duration {
        if !self.started {
            self.hooks.on_startup().await;
            self.started = true;
        }

        let now = Utc::now();
        let triggers = self.triggers.read();
        self.apply_triggers(&triggers).await;

        self.hooks.run_cycle(now, &triggers).await;
        let interval = self.hooks.next_interval(now, &triggers).await;
        tracing::debug!(interval_secs = interval.as_secs(), "Cycle complete");
        interval
    }

    /// Cycle until the future is dropped
    pub async fn run_forever(&mut self) {
        loop {
            let interval = self.run_once().await;
            tokio::time::sleep(interval).await;
        }
    }

    async fn apply_triggers(&mut self, triggers: &TriggerState) {
        let projection = self.hooks.projection();
        if let Some(token) = &triggers.unlocked_token {
            projection.unlock(token);
        } else if !projection.is_unlocked() {
            projection.lock();
        }

        if triggers.send_now {
            self.hooks.on_send_now().await;
        }
    }
}
