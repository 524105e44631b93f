//! Keel daemon library
//!
//! - Configuration loading (defaults, file, environment)
//! - Start-up definition loading
//! - Node lifecycle until shutdown

pub mod config;
pub mod daemon;
pub mod error;

pub use config::DaemonConfig;
pub use daemon::{load_definitions, Daemon};
pub use error::{DaemonError, DaemonResult};
