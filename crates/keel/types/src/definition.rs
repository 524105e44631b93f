//! Declarative container definitions
//!
//! A definition is what the operator applies. One definition expands into
//! `replicas` containers, each driven by its own control loop.

use crate::ids::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Dependency name that matches every container of a group.
pub const WILDCARD: &str = "*";

/// Default deadline for dependency and readiness waits.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for `replicas` of a single definition.
pub const MAX_REPLICAS: u64 = 10_000;

/// A container definition as applied by the operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerDefinition {
    pub meta: Meta,
    pub spec: ContainerSpec,
}

/// Definition metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub name: String,
    pub group: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Desired container specification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,

    #[serde(default = "default_tag")]
    pub tag: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default)]
    pub entrypoint: Vec<String>,

    /// `KEY=value` pairs, may contain `{{ key }}` placeholders
    #[serde(default)]
    pub env: Vec<String>,

    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,

    #[serde(default)]
    pub networks: Vec<String>,

    #[serde(default)]
    pub ports: Vec<PortSpec>,

    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,

    #[serde(default)]
    pub readiness: Vec<ReadinessSpec>,

    /// Optional init stage run between dependency resolution and start
    #[serde(default)]
    pub init: Option<InitSpec>,

    #[serde(default = "default_replicas")]
    pub replicas: u64,

    #[serde(default)]
    pub spread: Option<SpreadSpec>,

    /// Raw configuration values, resolved into the runtime configuration before start
    #[serde(default)]
    pub configuration: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub host_path: String,
    pub mount_point: String,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    pub container: u16,

    #[serde(default)]
    pub host: Option<u16>,

    #[serde(default = "default_protocol")]
    pub protocol: String,
}

/// Dependency on other containers reaching readiness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub group: String,

    /// Generated container name (`<group>-<name>-<index>`), or `*` for every container of the group
    pub name: String,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl DependencySpec {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.name == WILDCARD
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT_TIMEOUT)
    }
}

/// A readiness check; the container is ready only when all of them pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSpec {
    pub name: String,

    #[serde(flatten)]
    pub kind: ProbeKind,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ReadinessSpec {
    pub fn url(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProbeKind::Url {
                url: url.into(),
                method: HttpMethod::Get,
                body: BTreeMap::new(),
            },
            timeout_ms: None,
        }
    }

    pub fn command(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: ProbeKind::Command { command },
            timeout_ms: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_WAIT_TIMEOUT)
    }
}

/// What a readiness check does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeKind {
    /// HTTP request with a templated JSON body; passes on status 200
    Url {
        url: String,

        #[serde(default)]
        method: HttpMethod,

        #[serde(default)]
        body: BTreeMap<String, String>,
    },

    /// Command executed inside the container; passes on exit code 0
    Command { command: Vec<String> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

/// Init stage executed to completion before the main container starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitSpec {
    /// Image for the init stage, defaults to the main image
    #[serde(default)]
    pub image: Option<String>,

    pub command: Vec<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// How replica indices are spread over nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpreadPolicy {
    /// Only the listed nodes own replicas
    Specific,
    /// Every cluster member owns replicas
    Uniform,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadSpec {
    pub spread: SpreadPolicy,

    #[serde(default)]
    pub nodes: Vec<NodeId>,
}

impl SpreadSpec {
    pub fn specific(nodes: Vec<NodeId>) -> Self {
        Self {
            spread: SpreadPolicy::Specific,
            nodes,
        }
    }

    pub fn uniform() -> Self {
        Self {
            spread: SpreadPolicy::Uniform,
            nodes: Vec::new(),
        }
    }
}

/// Definition validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("Definition name must not be empty")]
    EmptyName,

    #[error("Definition group must not be empty")]
    EmptyGroup,

    #[error("Definition {0} has no image")]
    EmptyImage(String),

    #[error("Dependency on {group}/{name} is invalid")]
    InvalidDependency { group: String, name: String },

    #[error("{replicas} replicas requested, at most {max} allowed")]
    TooManyReplicas { replicas: u64, max: u64 },
}

impl ContainerDefinition {
    pub fn new(group: impl Into<String>, name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            meta: Meta {
                name: name.into(),
                group: group.into(),
                labels: BTreeMap::new(),
            },
            spec: ContainerSpec {
                image: image.into(),
                tag: default_tag(),
                command: Vec::new(),
                entrypoint: Vec::new(),
                env: Vec::new(),
                volumes: Vec::new(),
                networks: Vec::new(),
                ports: Vec::new(),
                dependencies: Vec::new(),
                readiness: Vec::new(),
                init: None,
                replicas: default_replicas(),
                spread: None,
                configuration: BTreeMap::new(),
            },
        }
    }

    pub fn with_replicas(mut self, replicas: u64) -> Self {
        self.spec.replicas = replicas;
        self
    }

    pub fn with_spread(mut self, spread: SpreadSpec) -> Self {
        self.spec.spread = Some(spread);
        self
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.spec.dependencies.push(dependency);
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessSpec) -> Self {
        self.spec.readiness.push(readiness);
        self
    }

    pub fn with_init(mut self, init: InitSpec) -> Self {
        self.spec.init = Some(init);
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.spec.networks.push(network.into());
        self
    }

    pub fn with_configuration(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.configuration.insert(key.into(), value.into());
        self
    }

    /// Structural checks only; semantic validation belongs to the API surface.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.meta.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if self.meta.group.trim().is_empty() {
            return Err(DefinitionError::EmptyGroup);
        }
        if self.spec.image.trim().is_empty() {
            return Err(DefinitionError::EmptyImage(self.meta.name.clone()));
        }
        if self.spec.replicas > MAX_REPLICAS {
            return Err(DefinitionError::TooManyReplicas {
                replicas: self.spec.replicas,
                max: MAX_REPLICAS,
            });
        }
        for dependency in &self.spec.dependencies {
            if dependency.group.is_empty() || dependency.name.is_empty() {
                return Err(DefinitionError::InvalidDependency {
                    group: dependency.group.clone(),
                    name: dependency.name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_replicas() -> u64 {
    1
}

fn default_protocol() -> String {
    "tcp".to_string()
}
