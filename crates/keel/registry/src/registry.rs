//! Container registry
//!
//! The only structure shared by every container task. Reads and writes go
//! through a `DashMap`, so no global lock serialises containers.

use crate::entry::Entry;
use crate::error::Result;
use crate::store::StateStore;
use dashmap::DashMap;
use keel_types::{Container, ContainerKey, ContainerSnapshot, NodeId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Consecutive DEAD transitions tolerated before a container is parked in BACKOFF.
pub const DEFAULT_CRASH_LOOP_THRESHOLD: u32 = 5;

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackOff {
    /// Consecutive failures including this one
    pub failures: u32,

    /// More failures than the threshold allows
    pub exceeded: bool,
}

/// Directory of local containers and ghosts
pub struct ContainerRegistry {
    prefix: String,
    node: NodeId,
    entries: DashMap<ContainerKey, Entry>,
    failures: DashMap<ContainerKey, u32>,
    threshold: u32,
    store: Arc<dyn StateStore>,
}

impl ContainerRegistry {
    pub fn new(prefix: impl Into<String>, node: NodeId, store: Arc<dyn StateStore>) -> Self {
        Self {
            prefix: prefix.into(),
            node,
            entries: DashMap::new(),
            failures: DashMap::new(),
            threshold: DEFAULT_CRASH_LOOP_THRESHOLD,
            store,
        }
    }

    pub fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Insert or replace the local view of a container.
    pub fn add_or_update(&self, container: Container) {
        self.entries.insert(container.key(), Entry::Local(container));
    }

    /// Record a peer-owned container. Never shadows a local container.
    pub fn add_ghost(&self, snapshot: ContainerSnapshot) -> bool {
        let key = snapshot.key();
        match self.entries.get(&key).map(|e| e.is_ghost()) {
            Some(false) => {
                debug!(key = %key, "Ignoring ghost for locally owned container");
                false
            }
            _ => {
                self.entries.insert(key, Entry::Ghost(snapshot));
                true
            }
        }
    }

    pub fn find(&self, group: &str, name: &str) -> Option<Entry> {
        self.entries
            .get(&ContainerKey::new(group, name))
            .map(|e| e.clone())
    }

    pub fn find_group(&self, group: &str) -> Vec<Entry> {
        self.entries
            .iter()
            .filter(|e| e.key().group == group)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Remove a local container. A ghost under the same key belongs to its
    /// owner and stays; use [`ContainerRegistry::remove_ghost`] for those.
    pub fn remove(&self, group: &str, name: &str) -> Option<Entry> {
        let key = ContainerKey::new(group, name);
        self.failures.remove(&key);
        self.entries
            .remove_if(&key, |_, e| !e.is_ghost())
            .map(|(_, entry)| entry)
    }

    /// Keys of every ghost.
    pub fn ghosts(&self) -> Vec<ContainerKey> {
        self.entries
            .iter()
            .filter(|e| e.is_ghost())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Remove `key` only if it is a ghost.
    pub fn remove_ghost(&self, key: &ContainerKey) -> bool {
        self.entries.remove_if(key, |_, e| e.is_ghost()).is_some()
    }

    /// Count one more consecutive failure.
    pub fn back_off(&self, key: &ContainerKey) -> BackOff {
        let mut count = self.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        self.judge(*count)
    }

    /// Failures counted so far, without counting a new one.
    pub fn back_off_status(&self, key: &ContainerKey) -> BackOff {
        self.judge(self.failures(key))
    }

    fn judge(&self, failures: u32) -> BackOff {
        BackOff {
            failures,
            exceeded: failures > self.threshold,
        }
    }

    pub fn back_off_reset(&self, key: &ContainerKey) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &ContainerKey) -> u32 {
        self.failures.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Publish a container's current definition and status to the store.
    pub async fn sync(&self, snapshot: ContainerSnapshot) -> Result<()> {
        let key = snapshot.key();
        self.store.sync(snapshot).await.map_err(|e| {
            warn!(key = %key, error = %e, "Failed to sync container state");
            e
        })
    }

    /// Withdraw a container from the store, unless the stored snapshot is
    /// owned by another node.
    pub async fn unpublish(&self, key: &ContainerKey) -> Result<bool> {
        let stored = self.store.find(&self.prefix, &key.group, &key.name).await?;
        match stored {
            Some(snapshot) if snapshot.owner() != self.node => {
                debug!(key = %key, owner = %snapshot.owner(), "Snapshot owned elsewhere, keeping it");
                Ok(false)
            }
            Some(_) => {
                self.store.remove(&self.prefix, key).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStateStore;
    use keel_types::{ContainerDefinition, State};

    fn registry() -> ContainerRegistry {
        ContainerRegistry::new("keel", NodeId::new(1), Arc::new(InMemoryStateStore::new()))
    }

    fn container(name: &str, index: u64) -> Container {
        Container::new(
            "keel",
            ContainerDefinition::new("db", name, "postgres"),
            index,
            NodeId::new(1),
        )
    }

    #[test]
    fn test_add_find_remove() {
        let registry = registry();
        registry.add_or_update(container("postgres", 1));
        registry.add_or_update(container("postgres", 2));
        registry.add_or_update(container("redis", 1));

        assert!(registry.find("db", "db-postgres-1").is_some());
        assert_eq!(registry.find_group("db").len(), 3);

        assert!(registry.remove("db", "db-postgres-1").is_some());
        assert!(registry.find("db", "db-postgres-1").is_none());
        assert_eq!(registry.find_group("db").len(), 2);
    }

    #[test]
    fn test_ghost_never_shadows_local() {
        let registry = registry();
        let local = container("postgres", 1);
        let mut remote = local.clone();
        remote.runtime.node = NodeId::new(2);
        assert!(remote.status.transition(State::Prepare));

        registry.add_or_update(local);
        assert!(!registry.add_ghost(remote.snapshot("simulated", serde_json::Value::Null)));
        assert!(!registry.find("db", "db-postgres-1").unwrap().is_ghost());
        assert!(!registry.remove_ghost(&ContainerKey::new("db", "db-postgres-1")));
    }

    #[test]
    fn test_back_off_threshold() {
        let registry = registry();
        let key = ContainerKey::new("db", "db-postgres-1");

        for expected in 1..=5 {
            let backoff = registry.back_off(&key);
            assert_eq!(backoff.failures, expected);
            assert!(!backoff.exceeded);
        }
        assert!(registry.back_off(&key).exceeded);

        assert_eq!(registry.back_off_status(&key).failures, 6);
        assert_eq!(registry.failures(&key), 6);

        registry.back_off_reset(&key);
        assert_eq!(registry.failures(&key), 0);
        assert!(!registry.back_off(&key).exceeded);
    }

    #[tokio::test]
    async fn test_sync_reaches_store() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = ContainerRegistry::new("keel", NodeId::new(1), store.clone());
        let c = container("postgres", 1);

        registry
            .sync(c.snapshot("simulated", serde_json::Value::Null))
            .await
            .unwrap();
        let found = store.find("keel", "db", "db-postgres-1").await.unwrap();
        assert!(found.is_some());

        assert!(registry.unpublish(&c.key()).await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_peer_entries_survive_local_removal() {
        let store = Arc::new(InMemoryStateStore::new());
        let registry = ContainerRegistry::new("keel", NodeId::new(1), store.clone());
        let mut remote = container("postgres", 1);
        remote.runtime.node = NodeId::new(2);
        let snapshot = remote.snapshot("simulated", serde_json::Value::Null);

        store.sync(snapshot.clone()).await.unwrap();
        assert!(registry.add_ghost(snapshot));

        assert!(registry.remove("db", "db-postgres-1").is_none());
        assert!(registry.find("db", "db-postgres-1").unwrap().is_ghost());

        assert!(!registry.unpublish(&remote.key()).await.unwrap());
        assert!(store.find("keel", "db", "db-postgres-1").await.unwrap().is_some());
    }
}
