//! Error types for dependency and readiness checks

use keel_engine::EngineError;
use std::time::Duration;
use thiserror::Error;

/// Result type for health operations
pub type Result<T> = std::result::Result<T, HealthError>;

/// Why a single check attempt (or the whole wait) did not succeed
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HealthError {
    #[error("Dependency not found: {group}/{name}")]
    DependencyNotFound { group: String, name: String },

    #[error("Dependency not ready: {0}")]
    DependencyNotReady(String),

    #[error("Container is not running (engine reports {0})")]
    NotRunning(String),

    #[error("Command exited with code {0}")]
    ExitCode(i32),

    #[error("Unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Check timed out after {timeout:?}: {last_error}")]
    Timeout {
        timeout: Duration,
        last_error: String,
    },

    #[error("Check cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for HealthError {
    fn from(err: reqwest::Error) -> Self {
        HealthError::Http(err.to_string())
    }
}
