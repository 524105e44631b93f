//! Registry entries
//!
//! A container is either `Local` (owned by this node and driven by a local
//! control loop) or a `Ghost`: a placeholder hydrated from a peer's snapshot,
//! with no engine resource behind it on this node.

use keel_types::{ContainerId, ContainerKey, ContainerSnapshot, NodeId, State};

#[derive(Debug, Clone)]
pub enum Entry {
    Local(keel_types::Container),
    Ghost(ContainerSnapshot),
}

impl Entry {
    pub fn id(&self) -> &ContainerId {
        match self {
            Entry::Local(container) => &container.id,
            Entry::Ghost(snapshot) => &snapshot.general.id,
        }
    }

    pub fn key(&self) -> ContainerKey {
        self.id().key()
    }

    pub fn state(&self) -> State {
        match self {
            Entry::Local(container) => container.status.state,
            Entry::Ghost(snapshot) => snapshot.general.status.state,
        }
    }

    pub fn owner(&self) -> NodeId {
        match self {
            Entry::Local(container) => container.runtime.node,
            Entry::Ghost(snapshot) => snapshot.owner(),
        }
    }

    pub fn is_ghost(&self) -> bool {
        matches!(self, Entry::Ghost(_))
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }
}
