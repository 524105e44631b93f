//! Error types for the control layer

use keel_types::{ContainerKey, DefinitionError, StatusGraphError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Invalid definition: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Invalid status graph: {0}")]
    Graph(#[from] StatusGraphError),

    #[error("Registry error: {0}")]
    Registry(#[from] keel_registry::RegistryError),

    #[error("Container not found: {0}")]
    NotFound(ContainerKey),

    #[error("Container {key} was not removed within {timeout:?}")]
    DeleteTimeout { key: ContainerKey, timeout: Duration },

    #[error("Watcher for {0} is no longer running")]
    WatcherClosed(ContainerKey),
}

/// Result type for control operations
pub type Result<T> = std::result::Result<T, ControlError>;
