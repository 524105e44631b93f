//! Keel Registry - Directory of known containers
//!
//! This crate provides the registry infrastructure for Keel:
//!
//! - **ContainerRegistry**: Concurrency-safe directory of local containers and ghost
//!   placeholders for containers owned by other nodes, plus the crash-loop counter
//! - **StateStore**: Interface to the distributed store that replicates snapshots across nodes
//!
//! ## In-Memory vs Persistent
//!
//! [`InMemoryStateStore`] is suitable for development and for tests that run several
//! nodes in one process. Production clusters put a replicated backend behind the same trait.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod entry;
pub mod error;
pub mod registry;
pub mod store;

// Re-exports
pub use entry::Entry;
pub use error::{RegistryError, Result};
pub use registry::{BackOff, ContainerRegistry, DEFAULT_CRASH_LOOP_THRESHOLD};
pub use store::{InMemoryStateStore, StateStore, StoreChange};
