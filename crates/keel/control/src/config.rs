//! Node configuration

use keel_health::BackoffConfig;
use keel_types::NodeId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one node's control loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's id within the cluster
    #[serde(default = "default_node_id")]
    pub node_id: u64,

    /// Cluster membership used by `uniform` spreading; this node is always included
    #[serde(default)]
    pub cluster: Vec<u64>,

    /// Key prefix in the distributed store
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Periodic re-trigger of each control loop
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_ms: u64,

    /// Deadline for a dependency that does not set its own
    #[serde(default = "default_wait_timeout")]
    pub dependency_timeout_ms: u64,

    /// Deadline for a readiness check that does not set its own
    #[serde(default = "default_wait_timeout")]
    pub readiness_timeout_ms: u64,

    /// Consecutive deaths tolerated before BACKOFF
    #[serde(default = "default_crash_loop_threshold")]
    pub crash_loop_threshold: u32,

    /// Grace period for a stop before escalating to kill
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,

    /// How long a delete request waits for teardown
    #[serde(default = "default_delete_timeout")]
    pub delete_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Capacity of dependency and readiness result channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Capacity of the event broadcast
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            cluster: Vec::new(),
            prefix: default_prefix(),
            reconcile_interval_ms: default_reconcile_interval(),
            dependency_timeout_ms: default_wait_timeout(),
            readiness_timeout_ms: default_wait_timeout(),
            crash_loop_threshold: default_crash_loop_threshold(),
            stop_timeout_ms: default_stop_timeout(),
            delete_timeout_ms: default_delete_timeout(),
            backoff: BackoffConfig::default(),
            channel_capacity: default_channel_capacity(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl NodeConfig {
    pub fn node(&self) -> NodeId {
        NodeId::new(self.node_id)
    }

    /// Cluster membership including this node.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.cluster.iter().copied().map(NodeId::new).collect();
        members.push(self.node());
        members.sort();
        members.dedup();
        members
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms.max(1))
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_millis(self.dependency_timeout_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_timeout_ms)
    }
}

fn default_node_id() -> u64 {
    1
}

fn default_prefix() -> String {
    "keel".to_string()
}

fn default_reconcile_interval() -> u64 {
    5_000
}

fn default_wait_timeout() -> u64 {
    30_000
}

fn default_crash_loop_threshold() -> u32 {
    5
}

fn default_stop_timeout() -> u64 {
    10_000
}

fn default_delete_timeout() -> u64 {
    60_000
}

fn default_channel_capacity() -> usize {
    64
}

fn default_event_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.reconcile_interval(), Duration::from_secs(5));
        assert_eq!(config.dependency_timeout(), Duration::from_secs(30));
        assert_eq!(config.readiness_timeout(), Duration::from_secs(30));
        assert_eq!(config.crash_loop_threshold, 5);
        assert_eq!(config.members(), vec![NodeId::new(1)]);
    }

    #[test]
    fn test_members_include_self_once() {
        let config = NodeConfig {
            node_id: 2,
            cluster: vec![3, 1, 2],
            ..Default::default()
        };
        assert_eq!(config.members(), vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]);
    }
}
