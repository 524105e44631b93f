#![allow(dead_code)]

use keel_control::{Collaborators, Node, NodeConfig};
use keel_engine::{InMemoryDnsCache, SimulatedEngine};
use keel_health::BackoffConfig;
use keel_registry::InMemoryStateStore;
use keel_types::{ContainerKey, KeelEvent, KeelEventEnvelope, State};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(10);

pub struct Harness {
    pub node: Arc<Node>,
    pub engine: Arc<SimulatedEngine>,
    pub store: Arc<InMemoryStateStore>,
    pub dns: Arc<InMemoryDnsCache>,
}

pub fn fast_config(node_id: u64) -> NodeConfig {
    NodeConfig {
        node_id,
        reconcile_interval_ms: 20,
        dependency_timeout_ms: 300,
        readiness_timeout_ms: 300,
        stop_timeout_ms: 100,
        delete_timeout_ms: 5_000,
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(40),
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

pub fn harness(config: NodeConfig) -> Harness {
    harness_with(config, SimulatedEngine::new(), Arc::new(InMemoryStateStore::new()))
}

pub fn harness_with(config: NodeConfig, engine: SimulatedEngine, store: Arc<InMemoryStateStore>) -> Harness {
    let engine = Arc::new(engine);
    let dns = Arc::new(InMemoryDnsCache::new());
    let collaborators = Collaborators::new(engine.clone(), store.clone()).with_dns(dns.clone());
    let node = Node::new(config, collaborators).expect("node should start");
    Harness {
        node: Arc::new(node),
        engine,
        store,
        dns,
    }
}

pub fn key(group: &str, name: &str, index: u64) -> ContainerKey {
    ContainerKey::new(group, format!("{group}-{name}-{index}"))
}

/// Poll `check` every 10ms until it holds or [`WAIT`] elapses.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn state_of(node: &Node, key: &ContainerKey) -> Option<State> {
    node.container(&key.group, &key.name)
        .await
        .map(|container| container.status.state)
}

pub async fn wait_for_state(node: &Node, key: &ContainerKey, state: State) {
    eventually(&format!("{key} to reach {state}"), move || async move {
        state_of(node, key).await == Some(state)
    })
    .await;
}

/// Receive events until `stop` matches one, returning everything seen.
pub async fn collect_until<F>(rx: &mut broadcast::Receiver<KeelEventEnvelope>, mut stop: F) -> Vec<KeelEvent>
where
    F: FnMut(&KeelEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let envelope = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("event should arrive in time")
            .expect("event stream should stay open");
        let done = stop(&envelope.event);
        seen.push(envelope.event);
        if done {
            return seen;
        }
    }
}

/// `(from, to)` pairs of every state change of `key`.
pub fn transitions(events: &[KeelEvent], key: &ContainerKey) -> Vec<(State, State)> {
    events
        .iter()
        .filter_map(|event| match event {
            KeelEvent::StateChanged { key: k, from, to } if k == key => Some((*from, *to)),
            _ => None,
        })
        .collect()
}
