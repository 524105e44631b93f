//! Replica scheduler

use keel_types::{NodeId, SpreadPolicy, SpreadSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Indices this node must act on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaPlan {
    /// Owned indices; each is created, or re-applied if it already runs here
    pub create: Vec<u64>,

    /// Locally running indices this node no longer owns
    pub destroy: Vec<u64>,
}

/// Split `1..=count` into `parts` contiguous chunks whose sizes differ by at
/// most one; the first `count % parts` chunks get the extra index.
pub fn partition(count: u64, parts: usize) -> Vec<Vec<u64>> {
    if parts == 0 {
        return Vec::new();
    }

    let parts_u64 = parts as u64;
    let base = count / parts_u64;
    let remainder = count % parts_u64;

    let mut chunks = Vec::with_capacity(parts);
    let mut next = 1;
    for i in 0..parts_u64 {
        let size = base + u64::from(i < remainder);
        chunks.push((next..next + size).collect());
        next += size;
    }
    chunks
}

/// Placement from the point of view of one node
#[derive(Debug, Clone)]
pub struct ReplicaScheduler {
    node: NodeId,
    cluster: Vec<NodeId>,
}

impl ReplicaScheduler {
    pub fn new(node: NodeId, cluster: impl IntoIterator<Item = NodeId>) -> Self {
        let cluster: BTreeSet<NodeId> = cluster.into_iter().collect();
        Self {
            node,
            cluster: cluster.into_iter().collect(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn cluster(&self) -> &[NodeId] {
        &self.cluster
    }

    /// Policy used when a definition names none: only the node that received it.
    pub fn default_spread(origin: NodeId) -> SpreadSpec {
        SpreadSpec::specific(vec![origin])
    }

    /// Members that share the replicas, in partition order.
    fn node_set(&self, spread: &SpreadSpec) -> Vec<NodeId> {
        match spread.spread {
            SpreadPolicy::Uniform => self.cluster.clone(),
            SpreadPolicy::Specific => {
                let mut seen = BTreeSet::new();
                spread
                    .nodes
                    .iter()
                    .copied()
                    .filter(|node| seen.insert(*node))
                    .collect()
            }
        }
    }

    /// Chunk of `1..=desired` owned by this node; empty if it is not in the node set.
    pub fn owned(&self, spread: &SpreadSpec, desired: u64) -> Vec<u64> {
        let nodes = self.node_set(spread);
        match nodes.iter().position(|n| *n == self.node) {
            Some(position) => partition(desired, nodes.len())
                .into_iter()
                .nth(position)
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    pub fn replica_numbers(&self, spread: &SpreadSpec, desired: u64, existing: &[u64]) -> ReplicaPlan {
        let create = self.owned(spread, desired);
        let owned: BTreeSet<u64> = create.iter().copied().collect();
        let destroy: Vec<u64> = existing
            .iter()
            .copied()
            .filter(|index| !owned.contains(index))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        debug!(
            node = %self.node,
            desired,
            ?create,
            ?destroy,
            "Computed replica plan"
        );

        ReplicaPlan { create, destroy }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[u64]) -> Vec<NodeId> {
        ids.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_partition_balanced() {
        assert_eq!(partition(7, 3), vec![vec![1, 2, 3], vec![4, 5], vec![6, 7]]);
        assert_eq!(partition(2, 3), vec![vec![1], vec![2], Vec::<u64>::new()]);
        assert!(partition(5, 0).is_empty());
    }

    #[test]
    fn test_uniform_scale_out() {
        let cluster = nodes(&[1, 2, 3]);
        for (node, expected) in [(1u64, 1u64), (2, 2), (3, 3)] {
            let scheduler = ReplicaScheduler::new(NodeId::new(node), cluster.clone());
            let plan = scheduler.replica_numbers(&SpreadSpec::uniform(), 3, &[]);
            assert_eq!(plan.create, vec![expected]);
            assert!(plan.destroy.is_empty());
        }
    }

    #[test]
    fn test_uniform_scale_in() {
        let cluster = nodes(&[1, 2, 3]);
        let expected: [(u64, Vec<u64>, Vec<u64>); 3] =
            [(1, vec![1], vec![]), (2, vec![], vec![2]), (3, vec![], vec![3])];
        for (node, create, destroy) in expected {
            let scheduler = ReplicaScheduler::new(NodeId::new(node), cluster.clone());
            let plan = scheduler.replica_numbers(&SpreadSpec::uniform(), 1, &[node]);
            assert_eq!(plan.create, create, "node {node}");
            assert_eq!(plan.destroy, destroy, "node {node}");
        }
    }

    #[test]
    fn test_node_outside_specific_set_owns_nothing() {
        let scheduler = ReplicaScheduler::new(NodeId::new(4), nodes(&[1, 2, 3, 4]));
        let spread = SpreadSpec::specific(nodes(&[1, 2]));
        let plan = scheduler.replica_numbers(&spread, 4, &[3, 4]);
        assert!(plan.create.is_empty());
        assert_eq!(plan.destroy, vec![3, 4]);
    }

    #[test]
    fn test_default_spread_keeps_everything_on_origin() {
        let origin = NodeId::new(2);
        let scheduler = ReplicaScheduler::new(origin, nodes(&[1, 2, 3]));
        let plan = scheduler.replica_numbers(&ReplicaScheduler::default_spread(origin), 3, &[]);
        assert_eq!(plan.create, vec![1, 2, 3]);

        let other = ReplicaScheduler::new(NodeId::new(1), nodes(&[1, 2, 3]));
        let plan = other.replica_numbers(&ReplicaScheduler::default_spread(origin), 3, &[]);
        assert!(plan.create.is_empty());
    }
}
