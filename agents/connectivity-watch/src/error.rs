//! Error types for the Connectivity Watch Agent
//!
//! Only configuration loading and local persistence surface errors to callers;
//! probe, sink and trigger boundaries degrade instead of failing.

use thiserror::Error;

/// Main error type for agent operations
#[derive(Error, Debug)]
pub enum AgentError {
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// File access or I/O error
    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration or record parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AgentError {
    pub fn config(msg: impl Into<String>) -> Self {
        AgentError::Config(msg.into())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Parse(format!("JSON error: {}", err))
    }
}

impl From<serde_yaml::Error> for AgentError {
    fn from(err: serde_yaml::Error) -> Self {
        AgentError::Parse(format!("YAML error: {}", err))
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
