//! Keel Health - Waiting for a container to become usable
//!
//! Two helper tasks are spawned by a container's control loop:
//!
//! - [`DependencyGate`] waits until every declared dependency reports readiness
//! - [`ReadinessProber`] runs the container's own readiness checks after start
//!
//! Both retry with exponential backoff inside a per-check deadline, stream
//! [`ProgressMessage`]s to the caller and stop silently when the caller's
//! cancellation token fires.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod backoff;
pub mod dependency;
pub mod error;
pub mod progress;
pub mod readiness;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use dependency::DependencyGate;
pub use error::{HealthError, Result};
pub use progress::{Outcome, Progress, ProgressMessage, Reporter};
pub use readiness::ReadinessProber;
