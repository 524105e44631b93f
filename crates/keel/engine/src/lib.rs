//! Keel Engine - Interfaces to the container runtime and its neighbours
//!
//! The orchestrator never talks to a concrete runtime directly. It goes through:
//!
//! - **ContainerEngine**: run/stop/kill/exec/inspect against the runtime, plus lifecycle hooks
//! - **DnsCache**: service-discovery records published once a container is ready
//! - **TemplateResolver**: resolution of `{{ key }}` placeholders in configuration
//!
//! ## Simulated engine
//!
//! [`SimulatedEngine`] keeps containers in memory, supports failure injection and
//! counts calls. It backs the test-suite and the development daemon; production
//! deployments plug a real runtime adapter behind the same trait.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod dns;
pub mod engine;
pub mod error;
pub mod simulated;
pub mod template;

// Re-exports
pub use dns::{DnsAction, DnsCache, InMemoryDnsCache};
pub use engine::{
    ContainerEngine, EngineEvent, EngineState, ExecResult, LifecycleState, NetworkAddress,
};
pub use error::{EngineError, Result};
pub use simulated::{FailurePoint, SimulatedEngine};
pub use template::{PlaceholderResolver, Resolved, TemplateResolver};
