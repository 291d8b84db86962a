//! Connectivity Watch Agent
//!
//! Store-deployed agent that verifies outbound reachability (gateway, ISP,
//! public endpoints), logs only meaningful state changes, and ships health
//! telemetry to a remote collector with at-least-once delivery through
//! outages.
//!
//! # Components
//! - [`engine`]: bounded-concurrency TCP/TLS/HTTP probes with failure classification
//! - [`delta`]: change-triggered, heartbeat-backed CSV/JSONL logging
//! - [`telemetry`]: multi-sink dispatch with a durable on-disk queue
//! - [`policy`]: adaptive polling interval driven by a remote watchlist
//! - [`runtime`]: trigger-driven scheduling loop and the concrete agent

pub mod config;
pub mod delta;
pub mod engine;
pub mod error;
pub mod policy;
pub mod runtime;
pub mod telemetry;

// Re-export contracts
#[path = "../contracts/mod.rs"]
pub mod contracts;

pub use contracts::*;
pub use error::{AgentError, Result};
