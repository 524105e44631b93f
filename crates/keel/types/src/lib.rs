//! Keel Types - Core types for node-local container orchestration
//!
//! Keel drives declaratively defined containers through their lifecycle against a
//! container runtime engine, one control loop per container, while keeping a
//! cluster-aware replica count correct.
//!
//! ## Key Concepts
//!
//! - **ContainerDefinition**: What the operator applied (image, dependencies, readiness, replicas)
//! - **ContainerId**: Identity of one replica (prefix, group, name, index)
//! - **Status**: Lifecycle state backed by a directed transition graph
//! - **ContainerSnapshot**: Serialized shape exchanged with other nodes
//! - **Events**: Observability stream for listeners

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod container;
pub mod definition;
pub mod events;
pub mod ids;
pub mod snapshot;
pub mod status;

// Re-export main types
pub use container::{Container, Runtime};
pub use definition::{
    ContainerDefinition, ContainerSpec, DefinitionError, DependencySpec, HttpMethod, InitSpec,
    Meta, PortSpec, ProbeKind, ReadinessSpec, SpreadPolicy, SpreadSpec, VolumeSpec,
    DEFAULT_WAIT_TIMEOUT, MAX_REPLICAS, WILDCARD,
};
pub use events::{EventSeverity, KeelEvent, KeelEventEnvelope};
pub use ids::{ContainerId, ContainerKey, NodeId};
pub use snapshot::{ContainerSnapshot, GeneralSnapshot};
pub use status::{Category, State, Status, StatusGraphError, StatusMachine};
