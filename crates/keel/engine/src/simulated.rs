//! In-memory container engine
//!
//! Models the runtime's lifecycle closely enough to drive the control loop:
//! `run` creates a running container, `stop`/`kill` leave it exited, `delete`
//! refuses running containers. Failures can be injected per operation.

use crate::engine::{ContainerEngine, EngineState, ExecResult, LifecycleState, NetworkAddress};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use keel_types::Container;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// Operation a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    /// Every call fails as if the daemon socket were gone
    Unreachable,
    Run,
    Stop,
    Kill,
    Delete,
    Exec,
    PreRun,
    PostRun,
    Init,
}

#[derive(Debug, Clone)]
struct SimulatedContainer {
    state: LifecycleState,
    ip: Ipv4Addr,
}

/// Simulated runtime for development and tests
#[derive(Debug)]
pub struct SimulatedEngine {
    containers: DashMap<String, SimulatedContainer>,

    /// Remaining failures per point, `u32::MAX` means "until cleared"
    failures: DashMap<FailurePoint, u32>,

    exec_exit_code: AtomicI32,
    latency: Duration,
    next_ip: AtomicU32,

    calls: DashMap<&'static str, usize>,
    in_flight: DashMap<String, usize>,
    max_in_flight: AtomicUsize,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self {
            containers: DashMap::new(),
            failures: DashMap::new(),
            exec_exit_code: AtomicI32::new(0),
            latency: Duration::ZERO,
            next_ip: AtomicU32::new(2),
            calls: DashMap::new(),
            in_flight: DashMap::new(),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every call, to widen race windows in tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail `point` until [`SimulatedEngine::clear_failure`] is called.
    pub fn inject_failure(&self, point: FailurePoint) {
        self.failures.insert(point, u32::MAX);
    }

    /// Fail the next `times` calls of `point`.
    pub fn inject_failures(&self, point: FailurePoint, times: u32) {
        self.failures.insert(point, times);
    }

    pub fn clear_failure(&self, point: FailurePoint) {
        self.failures.remove(&point);
    }

    pub fn set_exec_exit_code(&self, code: i32) {
        self.exec_exit_code.store(code, Ordering::SeqCst);
    }

    /// Force the runtime's view of a container, e.g. to simulate a crash.
    pub fn set_state(&self, name: &str, state: LifecycleState) {
        match self.containers.get_mut(name) {
            Some(mut container) => container.state = state,
            None => {
                let ip = self.allocate_ip();
                self.containers
                    .insert(name.to_string(), SimulatedContainer { state, ip });
            }
        }
    }

    pub fn state_of(&self, name: &str) -> LifecycleState {
        self.containers
            .get(name)
            .map(|c| c.state)
            .unwrap_or(LifecycleState::Empty)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    /// Number of calls made to `operation` (`"run"`, `"stop"`, ...).
    pub fn calls(&self, operation: &str) -> usize {
        self.calls.get(operation).map(|c| *c).unwrap_or(0)
    }

    /// Highest number of concurrent calls observed for a single container.
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn allocate_ip(&self) -> Ipv4Addr {
        let n = self.next_ip.fetch_add(1, Ordering::SeqCst);
        Ipv4Addr::new(10, 0, ((n >> 8) & 0xff) as u8, (n & 0xff) as u8)
    }

    fn should_fail(&self, point: FailurePoint) -> bool {
        let mut exhausted = false;
        let fail = match self.failures.get_mut(&point) {
            Some(mut remaining) => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                    exhausted = *remaining == 0;
                }
                true
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(&point);
        }
        fail
    }

    async fn enter(&self, container: &Container, operation: &'static str) -> Result<CallGuard<'_>> {
        let name = container.generated_name();
        *self.calls.entry(operation).or_insert(0) += 1;

        let concurrent = {
            let mut count = self.in_flight.entry(name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
        let guard = CallGuard { engine: self, name };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if self.should_fail(FailurePoint::Unreachable) {
            return Err(EngineError::Unreachable(
                "simulated daemon is not responding".to_string(),
            ));
        }
        Ok(guard)
    }

    fn injected(&self, point: FailurePoint, name: &str) -> Result<()> {
        if self.should_fail(point) {
            return Err(EngineError::Hook {
                hook: format!("{point:?}").to_lowercase(),
                reason: format!("injected failure for {name}"),
            });
        }
        Ok(())
    }

    fn require(&self, name: &str) -> Result<LifecycleState> {
        self.containers
            .get(name)
            .map(|c| c.state)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    fn move_to(&self, name: &str, state: LifecycleState) {
        if let Some(mut container) = self.containers.get_mut(name) {
            container.state = state;
        }
    }
}

impl Default for SimulatedEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct CallGuard<'a> {
    engine: &'a SimulatedEngine,
    name: String,
}

impl CallGuard<'_> {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut count) = self.engine.in_flight.get_mut(&self.name) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ContainerEngine for SimulatedEngine {
    fn kind(&self) -> &str {
        "simulated"
    }

    async fn state(&self, container: &Container) -> EngineState {
        match self.enter(container, "state").await {
            Ok(call) => EngineState::of(self.state_of(call.name())),
            Err(e) => EngineState::failed(e.to_string()),
        }
    }

    async fn run(&self, container: &Container) -> Result<()> {
        let call = self.enter(container, "run").await?;
        self.injected(FailurePoint::Run, call.name())?;

        if self.state_of(call.name()).is_present() {
            return Err(EngineError::AlreadyExists(call.name().to_string()));
        }

        let ip = self.allocate_ip();
        self.containers.insert(
            call.name().to_string(),
            SimulatedContainer {
                state: LifecycleState::Running,
                ip,
            },
        );
        debug!(name = %call.name(), ip = %ip, "Simulated container running");
        Ok(())
    }

    async fn start(&self, container: &Container) -> Result<()> {
        let call = self.enter(container, "start").await?;
        match self.require(call.name())? {
            LifecycleState::Created | LifecycleState::Exited => {
                self.move_to(call.name(), LifecycleState::Running);
                Ok(())
            }
            LifecycleState::Running => Ok(()),
            other => Err(EngineError::InvalidState {
                name: call.name().to_string(),
                state: other.to_string(),
            }),
        }
    }

    async fn stop(&self, container: &Container, _timeout: Duration) -> Result<()> {
        let call = self.enter(container, "stop").await?;
        self.injected(FailurePoint::Stop, call.name())?;
        self.require(call.name())?;
        self.move_to(call.name(), LifecycleState::Exited);
        Ok(())
    }

    async fn kill(&self, container: &Container, _signal: &str) -> Result<()> {
        let call = self.enter(container, "kill").await?;
        self.injected(FailurePoint::Kill, call.name())?;
        self.require(call.name())?;
        self.move_to(call.name(), LifecycleState::Exited);
        Ok(())
    }

    async fn restart(&self, container: &Container) -> Result<()> {
        let call = self.enter(container, "restart").await?;
        self.require(call.name())?;
        self.move_to(call.name(), LifecycleState::Running);
        Ok(())
    }

    async fn delete(&self, container: &Container) -> Result<()> {
        let call = self.enter(container, "delete").await?;
        self.injected(FailurePoint::Delete, call.name())?;
        match self.require(call.name())? {
            LifecycleState::Running => Err(EngineError::InvalidState {
                name: call.name().to_string(),
                state: LifecycleState::Running.to_string(),
            }),
            _ => {
                self.containers.remove(call.name());
                Ok(())
            }
        }
    }

    async fn rename(&self, container: &Container, new_name: &str) -> Result<()> {
        let call = self.enter(container, "rename").await?;
        let (_, entry) = self
            .containers
            .remove(call.name())
            .ok_or_else(|| EngineError::NotFound(call.name().to_string()))?;
        self.containers.insert(new_name.to_string(), entry);
        Ok(())
    }

    async fn exec(&self, container: &Container, command: &[String]) -> Result<ExecResult> {
        let call = self.enter(container, "exec").await?;
        self.injected(FailurePoint::Exec, call.name())?;
        match self.require(call.name())? {
            LifecycleState::Running => Ok(ExecResult {
                exit_code: self.exec_exit_code.load(Ordering::SeqCst),
                output: command.join(" "),
            }),
            other => Err(EngineError::InvalidState {
                name: call.name().to_string(),
                state: other.to_string(),
            }),
        }
    }

    async fn logs(&self, container: &Container) -> Result<String> {
        let call = self.enter(container, "logs").await?;
        let state = self.require(call.name())?;
        Ok(format!("{} is {}\n", call.name(), state))
    }

    async fn sync_network(&self, container: &Container) -> Result<Vec<NetworkAddress>> {
        let call = self.enter(container, "sync_network").await?;
        let ip = match self.containers.get(call.name()) {
            Some(c) if c.state == LifecycleState::Running => c.ip,
            _ => return Ok(Vec::new()),
        };

        let networks = if container.definition.spec.networks.is_empty() {
            vec!["bridge".to_string()]
        } else {
            container.definition.spec.networks.clone()
        };
        Ok(networks
            .into_iter()
            .map(|network| NetworkAddress {
                network,
                ip: IpAddr::V4(ip),
            })
            .collect())
    }

    async fn pre_run(&self, container: &Container) -> Result<()> {
        let call = self.enter(container, "pre_run").await?;
        self.injected(FailurePoint::PreRun, call.name())
    }

    async fn post_run(&self, container: &Container) -> Result<()> {
        let call = self.enter(container, "post_run").await?;
        self.injected(FailurePoint::PostRun, call.name())
    }

    async fn init_container(&self, container: &Container) -> Result<()> {
        let call = self.enter(container, "init").await?;
        self.injected(FailurePoint::Init, call.name())
    }

    fn platform_blob(&self, container: &Container) -> serde_json::Value {
        let name = container.generated_name();
        let state = self.state_of(&name);
        serde_json::json!({ "name": name, "state": state.as_str() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_types::{ContainerDefinition, NodeId};

    fn container() -> Container {
        Container::new(
            "keel",
            ContainerDefinition::new("web", "nginx", "nginx"),
            1,
            NodeId::new(1),
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = SimulatedEngine::new();
        let c = container();

        assert_eq!(engine.state(&c).await.state, LifecycleState::Empty);
        engine.run(&c).await.unwrap();
        assert_eq!(engine.state(&c).await.state, LifecycleState::Running);

        // running containers cannot be deleted
        assert!(engine.delete(&c).await.is_err());

        engine.stop(&c, Duration::from_secs(1)).await.unwrap();
        assert_eq!(engine.state(&c).await.state, LifecycleState::Exited);

        engine.delete(&c).await.unwrap();
        assert!(!engine.contains("web-nginx-1"));
        assert_eq!(engine.calls("run"), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let engine = SimulatedEngine::new();
        let c = container();

        engine.inject_failures(FailurePoint::Run, 1);
        assert!(engine.run(&c).await.is_err());
        assert!(engine.run(&c).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_reports_error_state() {
        let engine = SimulatedEngine::new();
        let c = container();

        engine.inject_failure(FailurePoint::Unreachable);
        let state = engine.state(&c).await;
        assert!(state.error.is_some());
        assert!(matches!(engine.run(&c).await, Err(EngineError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let engine = SimulatedEngine::new();
        let c = container();
        let cmd = vec!["true".to_string()];

        assert!(engine.exec(&c, &cmd).await.is_err());
        engine.run(&c).await.unwrap();
        engine.set_exec_exit_code(3);
        assert_eq!(engine.exec(&c, &cmd).await.unwrap().exit_code, 3);
    }
}
