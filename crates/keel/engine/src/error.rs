//! Engine error types

use thiserror::Error;

/// Errors reported by the engine adapter and its neighbours
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine daemon unreachable: {0}")]
    Unreachable(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Container already exists: {0}")]
    AlreadyExists(String),

    #[error("Container {name} is {state}, operation not possible")]
    InvalidState { name: String, state: String },

    #[error("Hook {hook} failed: {reason}")]
    Hook { hook: String, reason: String },

    #[error("Template error for {key}: {reason}")]
    Template { key: String, reason: String },

    #[error("DNS error: {0}")]
    Dns(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
