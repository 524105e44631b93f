//! Distributed state store interface
//!
//! The consensus layer itself lives outside Keel. Nodes only need to publish
//! their containers' snapshots, read peers' snapshots back and learn about
//! changes.

use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use keel_types::{ContainerKey, ContainerSnapshot};
use tokio::sync::broadcast;

/// Change applied to the store
#[derive(Debug, Clone)]
pub enum StoreChange {
    Updated(ContainerSnapshot),
    Removed { prefix: String, key: ContainerKey },
}

/// Replicated store of container snapshots
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Propose a snapshot and wait until it is applied.
    async fn sync(&self, snapshot: ContainerSnapshot) -> Result<()>;

    async fn find(&self, prefix: &str, group: &str, name: &str)
        -> Result<Option<ContainerSnapshot>>;

    async fn find_group(&self, prefix: &str, group: &str) -> Result<Vec<ContainerSnapshot>>;

    /// Every snapshot under `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerSnapshot>>;

    async fn remove(&self, prefix: &str, key: &ContainerKey) -> Result<()>;

    /// Stream of applied changes, from every node.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// In-memory store, shared by every node of an in-process cluster
pub struct InMemoryStateStore {
    snapshots: DashMap<(String, ContainerKey), ContainerSnapshot>,
    changes: broadcast::Sender<StoreChange>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Store whose change feed buffers at most `capacity` changes per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            snapshots: DashMap::new(),
            changes,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn sync(&self, snapshot: ContainerSnapshot) -> Result<()> {
        let key = (snapshot.general.id.prefix.clone(), snapshot.key());
        self.snapshots.insert(key, snapshot.clone());
        let _ = self.changes.send(StoreChange::Updated(snapshot));
        Ok(())
    }

    async fn find(
        &self,
        prefix: &str,
        group: &str,
        name: &str,
    ) -> Result<Option<ContainerSnapshot>> {
        let key = (prefix.to_string(), ContainerKey::new(group, name));
        Ok(self.snapshots.get(&key).map(|s| s.clone()))
    }

    async fn find_group(&self, prefix: &str, group: &str) -> Result<Vec<ContainerSnapshot>> {
        Ok(self
            .snapshots
            .iter()
            .filter(|entry| entry.key().0 == prefix && entry.key().1.group == group)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerSnapshot>> {
        Ok(self
            .snapshots
            .iter()
            .filter(|entry| entry.key().0 == prefix)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn remove(&self, prefix: &str, key: &ContainerKey) -> Result<()> {
        if self
            .snapshots
            .remove(&(prefix.to_string(), key.clone()))
            .is_some()
        {
            let _ = self.changes.send(StoreChange::Removed {
                prefix: prefix.to_string(),
                key: key.clone(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
