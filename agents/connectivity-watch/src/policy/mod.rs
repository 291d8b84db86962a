//! Cadence policy
//!
//! Picks the sleep interval between cycles and rate-limits the remote polls.
//! A watchlist entry for this store switches to the faster "watch" interval
//! until its expiry; expired overrides are never used.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::Cadence;
use crate::contracts::{WatchMode, Watchlist};

#[derive(Debug, Clone)]
pub struct CadencePolicy {
    cadence: Cadence,
    store: String,
    watch: Option<WatchMode>,
    last_watchlist_poll: Option<DateTime<Utc>>,
    last_refresh_poll: Option<DateTime<Utc>>,
}

impl CadencePolicy {
    pub fn new(cadence: Cadence, store: impl Into<String>) -> Self {
        Self {
            cadence,
            store: store.into(),
            watch: None,
            last_watchlist_poll: None,
            last_refresh_poll: None,
        }
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    /// Current override, if any (may be expired until the next purge)
    pub fn watch_mode(&self) -> Option<&WatchMode> {
        self.watch.as_ref()
    }

    /// Watch interval while an override is active, otherwise normal
    pub fn cadence_for(&self, now: DateTime<Utc>) -> Duration {
        match &self.watch {
            Some(watch) if watch.is_active(now) => self.cadence.watch,
            _ => self.cadence.normal,
        }
    }

    /// Bounded by the normal interval even while watching
    pub fn should_poll_watchlist(&self, now: DateTime<Utc>) -> bool {
        match self.last_watchlist_poll {
            None => true,
            Some(last) => elapsed(last, now) >= self.cadence.normal,
        }
    }

    /// Apply a fetched watchlist; records `now` as the poll time
    pub fn update_watchlist(&mut self, watchlist: &Watchlist, now: DateTime<Utc>) {
        self.last_watchlist_poll = Some(now);
        self.watch = watchlist
            .get(&self.store)
            .and_then(WatchMode::from_entry)
            .filter(|watch| watch.until >= now);

        match &self.watch {
            Some(watch) => tracing::info!(
                store = %self.store,
                mode = %watch.mode,
                until = %watch.until,
                "Watch mode active"
            ),
            None => tracing::debug!(store = %self.store, "No watch override"),
        }
    }

    /// True on first call and then once per refresh-poll interval; each true
    /// result becomes the new baseline
    pub fn should_poll_refresh_trigger(&mut self, now: DateTime<Utc>) -> bool {
        let due = match self.last_refresh_poll {
            None => true,
            Some(last) => elapsed(last, now) >= self.cadence.refresh_poll,
        };
        if due {
            self.last_refresh_poll = Some(now);
        }
        due
    }

    /// Drop an override whose expiry has passed
    pub fn clear_expired(&mut self, now: DateTime<Utc>) {
        if matches!(&self.watch, Some(watch) if !watch.is_active(now)) {
            tracing::info!(store = %self.store, "Watch mode expired");
            self.watch = None;
        }
    }
}

/// Negative spans (clock stepped back) count as zero
fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}
