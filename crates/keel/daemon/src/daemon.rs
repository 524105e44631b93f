//! Node lifecycle inside keeld
//!
//! The daemon wires a [`Node`] to the simulated engine and an in-memory store,
//! applies the start-up definitions and runs until the shutdown signal.

use keel_control::{Collaborators, Node};
use keel_engine::SimulatedEngine;
use keel_registry::InMemoryStateStore;
use keel_types::{ContainerDefinition, EventSeverity, KeelEventEnvelope};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};

pub struct Daemon {
    config: DaemonConfig,
    node: Arc<Node>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let engine = Arc::new(SimulatedEngine::new());
        let store = Arc::new(InMemoryStateStore::new());
        let node = Node::new(config.node.clone(), Collaborators::new(engine, store))?;

        Ok(Self {
            config,
            node: Arc::new(node),
        })
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Apply every definition of the configured directory. A definition the
    /// node rejects is logged and skipped; an unreadable file aborts start-up.
    pub async fn apply_definitions(&self) -> DaemonResult<usize> {
        let Some(dir) = &self.config.definitions.dir else {
            return Ok(0);
        };

        let mut applied = 0;
        for (path, definition) in load_definitions(dir)? {
            match self.node.apply(definition).await {
                Ok(plan) => {
                    info!(path = %path.display(), create = ?plan.create, destroy = ?plan.destroy, "Definition applied");
                    applied += 1;
                }
                Err(err) => error!(path = %path.display(), error = %err, "Definition rejected"),
            }
        }
        Ok(applied)
    }

    /// Run until `shutdown` resolves, then stop every control loop.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> DaemonResult<()> {
        let listener = self.node.spawn_store_listener();
        let events = spawn_event_logger(self.node.subscribe());

        let applied = self.apply_definitions().await?;
        info!(node = %self.node.id(), applied, "keeld running");

        shutdown.await;

        info!("keeld shutting down");
        self.node.shutdown().await;
        listener.abort();
        events.abort();
        Ok(())
    }
}

/// Read `*.json` definitions from `dir`, sorted by file name.
pub fn load_definitions(dir: &Path) -> DaemonResult<Vec<(PathBuf, ContainerDefinition)>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_error(dir))? {
        let path = entry.map_err(io_error(dir))?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = std::fs::read_to_string(&path).map_err(io_error(&path))?;
        let definition: ContainerDefinition = serde_json::from_str(&raw).map_err(|source| DaemonError::Definition {
            path: path.clone(),
            source,
        })?;
        definitions.push((path, definition));
    }
    Ok(definitions)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> DaemonError {
    let path = path.to_path_buf();
    move |source| DaemonError::Io { path, source }
}

/// Mirror the node's event stream into the log at each event's severity.
fn spawn_event_logger(mut events: broadcast::Receiver<KeelEventEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(envelope) => match envelope.severity {
                    EventSeverity::Error => error!(event = ?envelope.event, "Event"),
                    EventSeverity::Warning => warn!(event = ?envelope.event, "Event"),
                    EventSeverity::Info | EventSeverity::Debug => debug!(event = ?envelope.event, "Event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefinitionsConfig;
    use keel_types::State;
    use std::time::Duration;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("keeld-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_load_definitions_sorted_json_only() {
        let dir = scratch_dir("load");
        std::fs::write(dir.join("b.json"), r#"{"meta":{"name":"api","group":"app"},"spec":{"image":"api"}}"#).unwrap();
        std::fs::write(dir.join("a.json"), r#"{"meta":{"name":"db","group":"app"},"spec":{"image":"postgres","replicas":2}}"#).unwrap();
        std::fs::write(dir.join("notes.txt"), "not a definition").unwrap();

        let loaded = load_definitions(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        let names: Vec<&str> = loaded.iter().map(|(_, d)| d.meta.name.as_str()).collect();
        assert_eq!(names, vec!["db", "api"]);
        assert_eq!(loaded[0].1.spec.replicas, 2);
        assert_eq!(loaded[1].1.spec.tag, "latest");
    }

    #[test]
    fn test_invalid_definition_names_the_file() {
        let dir = scratch_dir("invalid");
        std::fs::write(dir.join("broken.json"), r#"{"meta":{"name":"api"}}"#).unwrap();

        let err = load_definitions(&dir).unwrap_err();
        std::fs::remove_dir_all(&dir).unwrap();

        match err {
            DaemonError::Definition { path, .. } => assert!(path.ends_with("broken.json")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_applies_definitions_and_reaches_running() {
        let dir = scratch_dir("apply");
        std::fs::write(dir.join("web.json"), r#"{"meta":{"name":"nginx","group":"web"},"spec":{"image":"nginx"}}"#).unwrap();

        let mut config = DaemonConfig::default();
        config.node.reconcile_interval_ms = 20;
        config.definitions = DefinitionsConfig { dir: Some(dir.clone()) };

        let daemon = Daemon::new(config).unwrap();
        assert_eq!(daemon.apply_definitions().await.unwrap(), 1);
        std::fs::remove_dir_all(&dir).unwrap();

        let node = daemon.node().clone();
        let running = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let state = node.container("web", "web-nginx-1").await.map(|c| c.status.state);
                if state == Some(State::Running) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(running.is_ok());

        node.shutdown().await;
    }
}
