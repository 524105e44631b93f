//! Node facade
//!
//! A node owns one watcher per local container, the registry of local and
//! ghost containers, and the replica scheduler. Everything an operator or a
//! peer can do to a container goes through here.

use dashmap::mapref::entry::Entry as Slot;
use dashmap::DashMap;
use futures::future::try_join_all;
use keel_engine::{
    ContainerEngine, DnsCache, EngineEvent, InMemoryDnsCache, PlaceholderResolver, TemplateResolver,
};
use keel_placement::{ReplicaPlan, ReplicaScheduler};
use keel_registry::{ContainerRegistry, StateStore, StoreChange};
use keel_types::{
    Container, ContainerDefinition, ContainerId, ContainerKey, ContainerSnapshot, KeelEventEnvelope,
    NodeId, Status, StatusMachine,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::NodeConfig;
use crate::error::{ControlError, Result};
use crate::events::EventBus;
use crate::hooks::Hooks;
use crate::reconciler::Reconciler;
use crate::watcher::{ExternalEvent, WatcherHandle};

/// External systems a node talks to
#[derive(Clone)]
pub struct Collaborators {
    pub engine: Arc<dyn ContainerEngine>,
    pub store: Arc<dyn StateStore>,
    pub dns: Arc<dyn DnsCache>,
    pub templates: Arc<dyn TemplateResolver>,
}

impl Collaborators {
    /// In-memory DNS cache and `{{ key }}` placeholder templates around the
    /// given engine and store.
    pub fn new(engine: Arc<dyn ContainerEngine>, store: Arc<dyn StateStore>) -> Self {
        Self {
            engine,
            store,
            dns: Arc::new(InMemoryDnsCache::new()),
            templates: Arc::new(PlaceholderResolver),
        }
    }

    pub fn with_dns(mut self, dns: Arc<dyn DnsCache>) -> Self {
        self.dns = dns;
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateResolver>) -> Self {
        self.templates = templates;
        self
    }
}

pub struct Node {
    config: Arc<NodeConfig>,
    registry: Arc<ContainerRegistry>,
    reconciler: Arc<Reconciler>,
    scheduler: ReplicaScheduler,
    watchers: Arc<DashMap<ContainerKey, WatcherHandle>>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl Node {
    pub fn new(config: NodeConfig, collaborators: Collaborators) -> Result<Self> {
        StatusMachine::global().validate()?;

        let config = Arc::new(config);
        let node = config.node();
        let registry = Arc::new(
            ContainerRegistry::new(config.prefix.clone(), node, collaborators.store)
                .with_threshold(config.crash_loop_threshold),
        );
        let events = EventBus::new(node, config.event_capacity);
        let hooks = Hooks::new(
            collaborators.engine.clone(),
            collaborators.dns,
            collaborators.templates,
            config.dependency_timeout(),
            config.readiness_timeout(),
        );
        let reconciler = Arc::new(Reconciler::new(
            config.clone(),
            collaborators.engine,
            registry.clone(),
            hooks,
            events.clone(),
        ));
        let scheduler = ReplicaScheduler::new(node, config.members());

        info!(node = %node, members = ?config.members(), "Node initialized");

        Ok(Self {
            config,
            registry,
            reconciler,
            scheduler,
            watchers: Arc::new(DashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.config.node()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeelEventEnvelope> {
        self.events.subscribe()
    }

    /// Apply a definition: compute this node's replica plan, start or update
    /// the owned replicas and delete the ones it no longer owns.
    ///
    /// A definition without a spread policy is pinned to this node.
    #[instrument(skip_all, fields(group = %definition.meta.group, name = %definition.meta.name))]
    pub async fn apply(&self, mut definition: ContainerDefinition) -> Result<ReplicaPlan> {
        definition.validate()?;

        let spread = definition
            .spec
            .spread
            .get_or_insert_with(|| ReplicaScheduler::default_spread(self.id()))
            .clone();
        let group = definition.meta.group.clone();
        let name = definition.meta.name.clone();

        let existing = self.local_indices(&group, &name);
        let plan = self
            .scheduler
            .replica_numbers(&spread, definition.spec.replicas, &existing);

        for index in &plan.create {
            self.place(&definition, *index).await?;
        }

        try_join_all(plan.destroy.iter().map(|index| {
            let id = ContainerId::new(self.config.prefix.clone(), group.clone(), name.clone(), *index);
            self.delete_key(id.key())
        }))
        .await?;

        info!(create = ?plan.create, destroy = ?plan.destroy, "Definition applied");
        Ok(plan)
    }

    /// Delete every local replica of `definition`.
    pub async fn remove_definition(&self, definition: &ContainerDefinition) -> Result<()> {
        let keys: Vec<ContainerKey> = self
            .watchers
            .iter()
            .filter(|entry| {
                let id = entry.value().id();
                id.group == definition.meta.group && id.name == definition.meta.name
            })
            .map(|entry| entry.key().clone())
            .collect();

        try_join_all(keys.into_iter().map(|key| self.delete_key(key))).await?;
        Ok(())
    }

    /// Drive a container through deletion and wait for its watcher to finish.
    pub async fn delete(&self, group: &str, name: &str) -> Result<()> {
        self.delete_key(ContainerKey::new(group, name)).await
    }

    async fn delete_key(&self, key: ContainerKey) -> Result<()> {
        let handle = self.handle(&key)?;
        info!(container = %key, "Deleting container");
        handle.delete(self.config.delete_timeout()).await
    }

    /// Ask for a reconciliation outside the timer cadence.
    pub fn reconcile(&self, group: &str, name: &str) -> Result<()> {
        self.handle(&ContainerKey::new(group, name))?.enqueue()
    }

    /// Stop periodic reconciliation; explicit triggers still run.
    pub async fn pause(&self, group: &str, name: &str) -> Result<()> {
        self.handle(&ContainerKey::new(group, name))?.set_paused(true).await
    }

    pub async fn resume(&self, group: &str, name: &str) -> Result<()> {
        self.handle(&ContainerKey::new(group, name))?.set_paused(false).await
    }

    /// Reset a container parked in BACKOFF, DAEMON_FAILURE or INIT_FAILED.
    pub async fn retry(&self, group: &str, name: &str) -> Result<()> {
        self.send(group, name, ExternalEvent::Retry).await
    }

    pub async fn restart(&self, group: &str, name: &str) -> Result<()> {
        self.send(group, name, ExternalEvent::Restart).await
    }

    pub async fn engine_event(&self, group: &str, name: &str, event: EngineEvent) -> Result<()> {
        self.send(group, name, ExternalEvent::Engine(event)).await
    }

    async fn send(&self, group: &str, name: &str, event: ExternalEvent) -> Result<()> {
        self.handle(&ContainerKey::new(group, name))?.send(event).await
    }

    /// Current state of a local container.
    pub async fn container(&self, group: &str, name: &str) -> Option<Container> {
        let handle = self.watcher(&ContainerKey::new(group, name))?;
        Some(handle.container().await)
    }

    pub fn containers(&self) -> Vec<ContainerKey> {
        self.watchers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Record a container owned by another node. Never shadows a local one.
    pub fn observe_remote(&self, snapshot: ContainerSnapshot) -> bool {
        if snapshot.owner() == self.id() || snapshot.general.id.prefix != self.config.prefix {
            return false;
        }
        self.registry.add_ghost(snapshot)
    }

    /// Drop the ghost for `key`; a local replica waiting for it can proceed.
    pub fn forget_remote(&self, key: &ContainerKey) -> bool {
        let removed = self.registry.remove_ghost(key);
        if removed {
            debug!(container = %key, "Ghost released");
            if let Some(handle) = self.watcher(key) {
                let _ = handle.enqueue();
            }
        }
        removed
    }

    /// Mirror peers' containers from the store until shutdown.
    pub fn spawn_store_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.registry.store().subscribe();
        let node = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    biased;
                    _ = node.shutdown.cancelled() => break,
                    change = changes.recv() => change,
                };

                match change {
                    Ok(StoreChange::Updated(snapshot)) => {
                        node.observe_remote(snapshot);
                    }
                    Ok(StoreChange::Removed { prefix, key }) => {
                        if prefix == node.config.prefix {
                            node.forget_remote(&key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Store listener lagged behind, resynchronising");
                        if let Err(err) = node.resync_remote().await {
                            warn!(error = %err, "Failed to resynchronise with the store");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Rebuild the ghost view from the store: drop ghosts the store no longer
    /// holds and mirror everything it does.
    pub async fn resync_remote(&self) -> Result<()> {
        let snapshots = self.registry.store().list(&self.config.prefix).await?;
        let present: HashSet<ContainerKey> = snapshots.iter().map(|snapshot| snapshot.key()).collect();

        for key in self.registry.ghosts() {
            if !present.contains(&key) {
                self.forget_remote(&key);
            }
        }
        let mirrored = snapshots
            .into_iter()
            .filter(|snapshot| self.observe_remote(snapshot.clone()))
            .count();
        debug!(mirrored, "Resynchronised with the store");
        Ok(())
    }

    /// Stop every watcher without deleting engine resources.
    pub async fn shutdown(&self) {
        info!(node = %self.id(), "Shutting down");
        self.shutdown.cancel();

        let handles: Vec<WatcherHandle> = self.watchers.iter().map(|entry| entry.value().clone()).collect();
        for handle in handles {
            handle.cancel();
            let _ = handle.wait_finished(self.config.delete_timeout()).await;
        }
    }

    /// Start the watcher of one replica, or hand the definition to the one
    /// already running. Checking for and inserting a watcher is one map
    /// operation, so concurrent applies never start two.
    async fn place(&self, definition: &ContainerDefinition, index: u64) -> Result<()> {
        let key = ContainerId::new(
            self.config.prefix.clone(),
            definition.meta.group.clone(),
            definition.meta.name.clone(),
            index,
        )
        .key();

        loop {
            let handle = match self.watchers.entry(key.clone()) {
                Slot::Vacant(slot) => {
                    slot.insert(self.spawn(definition.clone(), index));
                    return Ok(());
                }
                Slot::Occupied(mut slot) if slot.get().is_finished() => {
                    slot.insert(self.spawn(definition.clone(), index));
                    return Ok(());
                }
                Slot::Occupied(slot) => slot.get().clone(),
            };

            if handle.is_pending_delete().await {
                handle.wait_finished(self.config.delete_timeout()).await?;
                continue;
            }
            return handle.send(ExternalEvent::Apply(Box::new(definition.clone()))).await;
        }
    }

    /// Callers insert the returned handle into `watchers`.
    fn spawn(&self, definition: ContainerDefinition, index: u64) -> WatcherHandle {
        let mut container = Container::new(self.config.prefix.clone(), definition, index, self.id());
        let key = container.key();

        let ghost = self
            .registry
            .find(&key.group, &key.name)
            .is_some_and(|entry| entry.is_ghost());
        if ghost {
            info!(container = %key, "Container still owned elsewhere, waiting for transfer");
            container.status = Status::transfering();
        } else {
            self.registry.add_or_update(container.clone());
        }

        let watchers = Arc::clone(&self.watchers);
        WatcherHandle::spawn(container, &self.shutdown, Arc::clone(&self.reconciler), move |shared| {
            watchers.remove_if(shared.key(), |_, handle| handle.is(shared));
        })
    }

    fn watcher(&self, key: &ContainerKey) -> Option<WatcherHandle> {
        self.watchers.get(key).map(|handle| handle.clone())
    }

    fn handle(&self, key: &ContainerKey) -> Result<WatcherHandle> {
        self.watcher(key).ok_or_else(|| ControlError::NotFound(key.clone()))
    }

    fn local_indices(&self, group: &str, name: &str) -> Vec<u64> {
        let mut indices: Vec<u64> = self
            .watchers
            .iter()
            .filter(|entry| !entry.value().is_finished())
            .map(|entry| entry.value().id().clone())
            .filter(|id| id.group == group && id.name == name)
            .map(|id| id.index)
            .collect();
        indices.sort_unstable();
        indices
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
