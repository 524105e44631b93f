//! Serialized container shape exchanged through the distributed store
//!
//! A snapshot carries exactly what another node needs to build a ghost
//! placeholder: the engine-specific blob, the general part (identity, labels,
//! runtime and status) and the engine kind.

use crate::container::Runtime;
use crate::definition::ContainerDefinition;
use crate::ids::{ContainerId, ContainerKey, NodeId};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Snapshot of a container as published to other nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSnapshot {
    /// Engine-specific blob; always holds the applied definition under `definition`
    pub platform: serde_json::Value,

    pub general: GeneralSnapshot,

    /// Engine kind that produced the snapshot
    #[serde(rename = "Type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralSnapshot {
    pub id: ContainerId,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    pub runtime: Runtime,

    pub status: Status,
}

impl ContainerSnapshot {
    pub fn key(&self) -> ContainerKey {
        self.general.id.key()
    }

    pub fn owner(&self) -> NodeId {
        self.general.runtime.node
    }

    pub fn definition(&self) -> Option<ContainerDefinition> {
        self.platform
            .get("definition")
            .cloned()
            .and_then(|raw| serde_json::from_value(raw).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::State;

    #[test]
    fn test_snapshot_shape() {
        let definition = ContainerDefinition::new("db", "postgres", "postgres");
        let snapshot = ContainerSnapshot {
            platform: serde_json::json!({ "definition": definition }),
            general: GeneralSnapshot {
                id: ContainerId::new("keel", "db", "postgres", 1),
                labels: BTreeMap::new(),
                runtime: Runtime::new(NodeId::new(2)),
                status: Status::new(),
            },
            kind: "simulated".to_string(),
        };

        let raw = serde_json::to_value(&snapshot).unwrap();
        assert!(raw.get("Platform").is_some());
        assert!(raw.get("General").is_some());
        assert_eq!(raw["Type"], "simulated");
        assert_eq!(raw["General"]["status"]["state"], "CREATED");

        let back: ContainerSnapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(back.definition(), Some(definition));
        assert_eq!(back.owner(), NodeId::new(2));
        assert_eq!(back.general.status.state, State::Created);
    }
}
