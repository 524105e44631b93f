//! The managed container entity
//!
//! A container is one replica of a definition: identity, desired spec,
//! runtime data resolved while preparing it, and its lifecycle status.
//! Only the owning control loop mutates it.

use crate::definition::{ContainerDefinition, ReadinessSpec};
use crate::ids::{ContainerId, ContainerKey, NodeId};
use crate::snapshot::{ContainerSnapshot, GeneralSnapshot};
use crate::status::Status;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Runtime data resolved while preparing a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runtime {
    /// Owning node
    pub node: NodeId,

    /// Resolved configuration (templates and secrets already substituted)
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,

    /// Objects the resolved configuration was read from
    #[serde(default)]
    pub object_dependencies: Vec<String>,

    /// Resolved `KEY=value` environment
    #[serde(default)]
    pub env: Vec<String>,

    /// Readiness checks with URLs and bodies resolved
    #[serde(default)]
    pub readiness: Vec<ReadinessSpec>,
}

impl Runtime {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            configuration: BTreeMap::new(),
            object_dependencies: Vec::new(),
            env: Vec::new(),
            readiness: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub definition: ContainerDefinition,
    pub runtime: Runtime,
    pub status: Status,
}

impl Container {
    pub fn new(
        prefix: impl Into<String>,
        definition: ContainerDefinition,
        index: u64,
        node: NodeId,
    ) -> Self {
        let id = ContainerId::new(
            prefix,
            definition.meta.group.clone(),
            definition.meta.name.clone(),
            index,
        );
        Self {
            id,
            definition,
            runtime: Runtime::new(node),
            status: Status::new(),
        }
    }

    pub fn key(&self) -> ContainerKey {
        self.id.key()
    }

    pub fn generated_name(&self) -> String {
        self.id.generated_name()
    }

    pub fn group(&self) -> &str {
        &self.id.group
    }

    /// Build the exchange snapshot; `platform` is the engine's own blob.
    pub fn snapshot(&self, kind: &str, platform: serde_json::Value) -> ContainerSnapshot {
        let mut platform = match platform {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("engine".to_string(), other);
                map
            }
        };
        platform.insert(
            "definition".to_string(),
            serde_json::to_value(&self.definition).unwrap_or(serde_json::Value::Null),
        );

        ContainerSnapshot {
            platform: serde_json::Value::Object(platform),
            general: GeneralSnapshot {
                id: self.id.clone(),
                labels: self.definition.meta.labels.clone(),
                runtime: self.runtime.clone(),
                status: self.status.clone(),
            },
            kind: kind.to_string(),
        }
    }

    /// Rebuild a container from a peer's snapshot.
    pub fn from_snapshot(snapshot: &ContainerSnapshot) -> Option<Self> {
        let definition = snapshot.definition()?;
        Some(Self {
            id: snapshot.general.id.clone(),
            definition,
            runtime: snapshot.general.runtime.clone(),
            status: snapshot.general.status.clone(),
        })
    }
}
