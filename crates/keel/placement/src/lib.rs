//! Keel Placement - Replica index partitioning
//!
//! Placement is a pure function: given the desired replica count, the indices this
//! node already runs and a spread policy, decide which indices this node must
//! create (or re-apply) and which it must destroy.
//!
//! The index sequence `1..=N` is cut into contiguous, balanced chunks, one per
//! member of the relevant node set. Every node computes the same partition, so
//! the union of owned chunks is exactly `1..=N` without any coordination.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod scheduler;

pub use scheduler::{partition, ReplicaPlan, ReplicaScheduler};
