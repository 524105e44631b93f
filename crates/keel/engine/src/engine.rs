//! Container engine adapter trait

use crate::dns::{DnsAction, DnsCache};
use crate::error::Result;
use async_trait::async_trait;
use keel_types::{Container, ContainerSnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Lifecycle state as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Runtime knows nothing about the container
    Empty,
    Created,
    Running,
    Exited,
    Dead,
    Removing,
    Removed,
}

impl LifecycleState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => LifecycleState::Created,
            "running" => LifecycleState::Running,
            "exited" => LifecycleState::Exited,
            "dead" => LifecycleState::Dead,
            "removing" => LifecycleState::Removing,
            "removed" => LifecycleState::Removed,
            _ => LifecycleState::Empty,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Empty => "",
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Exited => "exited",
            LifecycleState::Dead => "dead",
            LifecycleState::Removing => "removing",
            LifecycleState::Removed => "removed",
        }
    }

    /// Whether the runtime still holds a resource for the container
    pub fn is_present(&self) -> bool {
        !matches!(self, LifecycleState::Empty | LifecycleState::Removed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Empty => write!(f, "<none>"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Result of a lifecycle inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineState {
    pub state: LifecycleState,
    pub error: Option<String>,
}

impl EngineState {
    pub fn of(state: LifecycleState) -> Self {
        Self { state, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: LifecycleState::Empty,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAddress {
    pub network: String,
    pub ip: IpAddr,
}

/// Out-of-band notification from the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The container process ended without being asked to
    Died,
}

/// Adapter over a concrete container runtime.
///
/// Every call is scoped to a single container and may block on runtime I/O;
/// callers run them on the owning container's task only.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Engine kind written into snapshots
    fn kind(&self) -> &str;

    /// Inspect the runtime's view of the container.
    async fn state(&self, container: &Container) -> EngineState;

    /// Create and start the container.
    async fn run(&self, container: &Container) -> Result<()>;

    async fn start(&self, container: &Container) -> Result<()>;

    /// Ask the container to stop, waiting up to `timeout`.
    async fn stop(&self, container: &Container, timeout: Duration) -> Result<()>;

    async fn kill(&self, container: &Container, signal: &str) -> Result<()>;

    async fn restart(&self, container: &Container) -> Result<()>;

    /// Remove the runtime resource.
    async fn delete(&self, container: &Container) -> Result<()>;

    async fn rename(&self, container: &Container, new_name: &str) -> Result<()>;

    async fn exec(&self, container: &Container, command: &[String]) -> Result<ExecResult>;

    async fn logs(&self, container: &Container) -> Result<String>;

    /// Reconcile network attachments and report the resulting addresses.
    async fn sync_network(&self, container: &Container) -> Result<Vec<NetworkAddress>>;

    /// Engine-specific preparation (image pull, volume creation, ...).
    async fn pre_run(&self, container: &Container) -> Result<()>;

    /// Engine-specific work once the container passed readiness.
    async fn post_run(&self, container: &Container) -> Result<()>;

    /// Run the init stage to completion.
    async fn init_container(&self, container: &Container) -> Result<()>;

    /// Engine-specific blob for the exchange snapshot.
    fn platform_blob(&self, _container: &Container) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn to_snapshot(&self, container: &Container) -> ContainerSnapshot {
        container.snapshot(self.kind(), self.platform_blob(container))
    }

    /// Publish service-discovery records for every attached network.
    async fn update_dns(&self, container: &Container, dns: &dyn DnsCache) -> Result<()> {
        for address in self.sync_network(container).await? {
            for domain in domains(container) {
                dns.propose(&domain, address.ip, DnsAction::Add).await?;
            }
        }
        Ok(())
    }

    /// Withdraw the records published by [`ContainerEngine::update_dns`].
    async fn remove_dns(&self, container: &Container, dns: &dyn DnsCache) -> Result<()> {
        for address in self.sync_network(container).await? {
            for domain in domains(container) {
                dns.propose(&domain, address.ip, DnsAction::Remove).await?;
            }
        }
        Ok(())
    }
}

/// Per-replica and headless (per-definition) record names.
pub fn domains(container: &Container) -> [String; 2] {
    [
        format!("{}.{}.private", container.generated_name(), container.group()),
        format!("{}.{}.private", container.id.name, container.group()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_parse() {
        assert_eq!(LifecycleState::parse("running"), LifecycleState::Running);
        assert_eq!(LifecycleState::parse("Exited"), LifecycleState::Exited);
        assert_eq!(LifecycleState::parse(""), LifecycleState::Empty);
        assert_eq!(LifecycleState::parse("paused?"), LifecycleState::Empty);
        assert!(LifecycleState::Dead.is_present());
        assert!(!LifecycleState::Removed.is_present());
    }
}
