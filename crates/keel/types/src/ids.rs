//! Identifiers for nodes and managed containers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node:{}", self.0)
    }
}

/// Registry key of a container: `(group, generated name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerKey {
    pub group: String,
    pub name: String,
}

impl ContainerKey {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Identity of a single container replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId {
    /// Store prefix shared by every node of the cluster
    pub prefix: String,

    /// Group the definition belongs to
    pub group: String,

    /// Definition name (without replica index)
    pub name: String,

    /// Replica index, starting at 1
    pub index: u64,
}

impl ContainerId {
    pub fn new(
        prefix: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
        index: u64,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            group: group.into(),
            name: name.into(),
            index,
        }
    }

    /// Name used against the engine and as registry key: `<group>-<name>-<index>`
    pub fn generated_name(&self) -> String {
        format!("{}-{}-{}", self.group, self.name, self.index)
    }

    pub fn key(&self) -> ContainerKey {
        ContainerKey::new(self.group.clone(), self.generated_name())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.generated_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_name() {
        let id = ContainerId::new("keel", "db", "postgres", 2);
        assert_eq!(id.generated_name(), "db-postgres-2");
        assert_eq!(id.key(), ContainerKey::new("db", "db-postgres-2"));
    }

    #[test]
    fn test_node_display() {
        assert_eq!(NodeId::new(3).to_string(), "node:3");
    }
}
