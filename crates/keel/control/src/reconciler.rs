//! Reconciler
//!
//! The state transition function of a container. Given the container's
//! current state and what the engine reports, one step decides the next state
//! and whether the chain should keep going immediately. The watcher applies the
//! result through the status machine; the reconciler itself never writes the
//! state.
//!
//! Steps block only on engine calls and on the dependency and readiness
//! channels, and those waits end as soon as the watcher interrupts them.

use keel_engine::{ContainerEngine, LifecycleState};
use keel_health::{DependencyGate, Progress, ProgressMessage, ReadinessProber, Reporter};
use keel_registry::ContainerRegistry;
use keel_types::{Container, ContainerKey, KeelEvent, State, StatusMachine};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::events::EventBus;
use crate::hooks::Hooks;
use crate::watcher::WatcherShared;

/// Result of one reconciliation step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub next: State,

    /// Run the next step right away instead of waiting for a trigger
    pub proceed: bool,
}

impl Step {
    fn go(next: State) -> Self {
        Self { next, proceed: true }
    }

    fn rest(next: State) -> Self {
        Self { next, proceed: false }
    }
}

/// Signal used when graceful stop fails
const KILL_SIGNAL: &str = "SIGKILL";

pub struct Reconciler {
    config: Arc<NodeConfig>,
    engine: Arc<dyn ContainerEngine>,
    registry: Arc<ContainerRegistry>,
    hooks: Hooks,
    dependencies: Arc<DependencyGate>,
    prober: Arc<ReadinessProber>,
    events: EventBus,
}

impl Reconciler {
    pub fn new(
        config: Arc<NodeConfig>,
        engine: Arc<dyn ContainerEngine>,
        registry: Arc<ContainerRegistry>,
        hooks: Hooks,
        events: EventBus,
    ) -> Self {
        let dependencies = Arc::new(DependencyGate::new(registry.clone(), config.backoff));
        let prober = Arc::new(ReadinessProber::new(engine.clone(), config.backoff));
        Self {
            config,
            engine,
            registry,
            hooks,
            dependencies,
            prober,
            events,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) async fn reconcile(&self, watcher: &WatcherShared, run: &CancellationToken, container: Container) -> Step {
        let state = container.status.state;
        debug!(%state, "Reconciling");

        match state {
            State::Transfering => self.transfering(&container),
            State::Created => self.created(&container).await,
            State::Clean => self.clean(&container).await,
            State::Prepare | State::Pending => self.prepare(watcher, run, container).await,
            State::DependsChecking => self.depends_checking(watcher, run).await,
            State::DependsSolved => match container.definition.spec.init {
                Some(_) => Step::go(State::Init),
                None => Step::go(State::Start),
            },
            State::DependsFailed => Step::go(State::Prepare),
            State::Init => match self.hooks.init(&container).await {
                Ok(()) => Step::go(State::Start),
                Err(err) => {
                    error!(error = %err, "Init stage failed");
                    Step::rest(State::InitFailed)
                }
            },
            State::Start => self.start(watcher, run, &container).await,
            State::ReadinessChecking => self.readiness_checking(watcher, run, &container).await,
            State::Ready => Step::go(State::Running),
            State::ReadinessFailed => Step::go(State::Kill),
            State::Kill => self.kill(&container).await,
            State::Dead => self.dead(&container).await,
            State::PendingDelete => self.pending_delete(watcher, &container).await,
            State::Running | State::InitFailed | State::Backoff | State::DaemonFailure => Step::rest(state),
            State::Unknown => Step::go(State::Created),
        }
    }

    fn transfering(&self, container: &Container) -> Step {
        let key = container.key();
        match self.registry.find(&key.group, &key.name) {
            Some(entry) if entry.is_ghost() => {
                debug!(owner = %entry.owner(), "Waiting for previous owner to release container");
                Step::rest(State::Transfering)
            }
            _ => Step::go(State::Created),
        }
    }

    async fn created(&self, container: &Container) -> Step {
        let observed = self.engine.state(container).await;
        if let Some(err) = observed.error {
            warn!(error = %err, "Engine state unavailable");
            return Step::rest(State::Created);
        }

        if observed.state.is_present() {
            debug!(engine = %observed.state, "Leftover engine resource, cleaning first");
            Step::go(State::Clean)
        } else {
            Step::go(State::Prepare)
        }
    }

    async fn clean(&self, container: &Container) -> Step {
        let observed = self.engine.state(container).await;
        if let Some(err) = observed.error {
            error!(error = %err, "Engine unreachable while cleaning");
            return Step::go(State::DaemonFailure);
        }

        match observed.state {
            LifecycleState::Empty | LifecycleState::Removed => Step::go(resume_after_clean(container)),
            LifecycleState::Created | LifecycleState::Exited | LifecycleState::Dead => {
                match self.engine.delete(container).await {
                    Ok(()) => Step::go(resume_after_clean(container)),
                    Err(err) => {
                        error!(error = %err, "Failed to delete engine resource");
                        Step::go(State::DaemonFailure)
                    }
                }
            }
            LifecycleState::Running if self.halt(container).await => Step::go(State::Clean),
            LifecycleState::Running => Step::go(State::DaemonFailure),
            LifecycleState::Removing => Step::rest(State::Clean),
        }
    }

    async fn prepare(&self, watcher: &WatcherShared, run: &CancellationToken, mut container: Container) -> Step {
        let state = container.status.state;
        if let Err(err) = self.hooks.pre_run(&mut container).await {
            warn!(error = %err, "Pre-run hook failed");
            return Step::rest(State::Pending);
        }

        if !watcher.update_runtime(state, container.runtime.clone()).await {
            return Step::rest(state);
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        watcher.slots.lock().await.depends = Some(rx);

        let reporter = Reporter::new(container.key(), tx, run.child_token());
        let gate = Arc::clone(&self.dependencies);
        let dependencies = self.hooks.dependencies(&container);
        debug!(count = dependencies.len(), "Starting dependency wait");
        tokio::spawn(async move {
            gate.ready(reporter, &dependencies).await;
        });

        Step::go(State::DependsChecking)
    }

    async fn depends_checking(&self, watcher: &WatcherShared, run: &CancellationToken) -> Step {
        let Some(mut rx) = watcher.slots.lock().await.depends.take() else {
            warn!("No dependency wait in progress");
            return Step::go(State::DependsFailed);
        };

        loop {
            let message = tokio::select! {
                biased;
                _ = run.cancelled() => return Step::go(State::DependsChecking),
                message = rx.recv() => message,
            };

            match message {
                Some(ProgressMessage { progress: Progress::Checking, error, .. }) => {
                    debug!(error = error.as_deref().unwrap_or_default(), "Dependencies still pending");
                }
                Some(ProgressMessage { progress: Progress::Success, .. }) => return Step::go(State::DependsSolved),
                Some(ProgressMessage { progress: Progress::Failed, error, .. }) => {
                    warn!(error = error.as_deref().unwrap_or_default(), "Dependencies not satisfied");
                    return Step::go(State::DependsFailed);
                }
                None => return Step::go(State::DependsFailed),
            }
        }
    }

    async fn start(&self, watcher: &WatcherShared, run: &CancellationToken, container: &Container) -> Step {
        if let Err(err) = self.engine.run(container).await {
            error!(error = %err, "Engine failed to run container");
            return Step::go(State::DaemonFailure);
        }
        info!(image = %container.definition.spec.image_ref(), "Container started");

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        watcher.slots.lock().await.readiness = Some(rx);

        let reporter = Reporter::new(container.key(), tx, run.child_token());
        let prober = Arc::clone(&self.prober);
        let probed = container.clone();
        tokio::spawn(async move {
            prober.ready(reporter, &probed, &probed.runtime.readiness).await;
        });

        Step::go(State::ReadinessChecking)
    }

    /// A `FAILED` progress message does not end the wait; the prober closes its
    /// channel right after, which does.
    async fn readiness_checking(&self, watcher: &WatcherShared, run: &CancellationToken, container: &Container) -> Step {
        let Some(mut rx) = watcher.slots.lock().await.readiness.take() else {
            warn!("No readiness wait in progress");
            return Step::go(State::ReadinessFailed);
        };

        loop {
            let message = tokio::select! {
                biased;
                _ = run.cancelled() => return Step::go(State::ReadinessChecking),
                message = rx.recv() => message,
            };

            let Some(message) = message else {
                warn!("Readiness checks ended without success");
                return Step::go(State::ReadinessFailed);
            };

            let observed = self.engine.state(container).await;
            if observed.state != LifecycleState::Running {
                warn!(engine = %observed.state, "Container stopped while waiting for readiness");
                return Step::go(State::ReadinessFailed);
            }

            match message.progress {
                Progress::Checking => {
                    debug!(error = message.error.as_deref().unwrap_or_default(), "Readiness pending");
                }
                Progress::Failed => {
                    warn!(error = message.error.as_deref().unwrap_or_default(), "Readiness check failed");
                }
                Progress::Success => {
                    return match self.hooks.post_run(container).await {
                        Ok(()) => Step::go(State::Ready),
                        Err(err) => {
                            error!(error = %err, "Post-run hook failed");
                            Step::go(State::Kill)
                        }
                    };
                }
            }
        }
    }

    async fn kill(&self, container: &Container) -> Step {
        if let Err(err) = self.hooks.remove_dns(container).await {
            debug!(error = %err, "Could not withdraw DNS records");
        }

        let observed = self.engine.state(container).await;
        if observed.error.is_none() && observed.state != LifecycleState::Running {
            return Step::rest(State::Dead);
        }

        if self.halt(container).await {
            Step::rest(State::Dead)
        } else {
            Step::go(State::DaemonFailure)
        }
    }

    /// The failure counter was bumped when DEAD was entered, so a step that
    /// gets superseded leaves it alone.
    async fn dead(&self, container: &Container) -> Step {
        let key = container.key();
        let backoff = self.registry.back_off_status(&key);
        if backoff.exceeded {
            error!(failures = backoff.failures, "Crash loop detected, backing off");
            self.events.emit(KeelEvent::CrashLoop {
                key,
                failures: backoff.failures,
            });
            return Step::go(State::Backoff);
        }

        let observed = self.engine.state(container).await;
        if observed.state == LifecycleState::Running && !self.halt(container).await {
            return Step::go(State::DaemonFailure);
        }

        if observed.state.is_present() {
            if let Err(err) = self.engine.delete(container).await {
                error!(error = %err, "Failed to delete dead container");
                return Step::go(State::DaemonFailure);
            }
        }

        info!(failures = backoff.failures, "Restarting dead container");
        Step::go(State::Prepare)
    }

    async fn pending_delete(&self, watcher: &WatcherShared, container: &Container) -> Step {
        if let Err(err) = self.hooks.remove_dns(container).await {
            debug!(error = %err, "Could not withdraw DNS records");
        }

        let observed = self.engine.state(container).await;
        if let Some(err) = observed.error {
            warn!(error = %err, "Engine unreachable, delete postponed");
            return Step::rest(State::PendingDelete);
        }

        if observed.state.is_present() {
            return Step::go(State::Clean);
        }

        info!("Engine resource gone, stopping watcher");
        watcher.cancel();
        Step::rest(State::PendingDelete)
    }

    /// Graceful stop, escalating to a forced kill. False when both failed.
    async fn halt(&self, container: &Container) -> bool {
        match self.engine.stop(container, self.config.stop_timeout()).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Graceful stop failed, killing");
                match self.engine.kill(container, KILL_SIGNAL).await {
                    Ok(()) => true,
                    Err(err) => {
                        error!(error = %err, "Kill failed");
                        false
                    }
                }
            }
        }
    }

    /// Log, count and broadcast a transition that happened.
    pub(crate) fn entered(&self, container: &Container, from: State) {
        let key = container.key();
        let to = container.status.state;
        info!(%from, %to, "State changed");

        match to {
            State::Running => self.registry.back_off_reset(&key),
            State::Dead => {
                let backoff = self.registry.back_off(&key);
                debug!(failures = backoff.failures, "Consecutive failure recorded");
            }
            _ => {}
        }
        self.events.emit(KeelEvent::StateChanged { key, from, to });
    }

    pub(crate) fn rejected(&self, container: &Container, to: State) {
        let from = container.status.state;
        warn!(%from, %to, "Transition not allowed");
        self.events.emit(KeelEvent::TransitionRejected {
            key: container.key(),
            from,
            to,
        });
    }

    pub(crate) fn reset_failures(&self, key: &ContainerKey) {
        self.registry.back_off_reset(key);
    }

    /// Sync the registry and the store. Callers never publish a container
    /// still waiting in TRANSFERING, so the ghost of its previous owner stays.
    pub(crate) async fn publish(&self, container: &Container) {
        self.registry.add_or_update(container.clone());
        let _ = self.registry.sync(self.engine.to_snapshot(container)).await;
    }

    /// Drop the container from the registry and the store. A container that
    /// never claimed its key leaves the previous owner's entries in place.
    pub(crate) async fn removed(&self, container: &Container, claimed: bool) {
        let key = container.key();
        if claimed {
            self.registry.remove(&key.group, &key.name);
            if let Err(err) = self.registry.unpublish(&key).await {
                warn!(error = %err, "Failed to unpublish container");
            }
        } else {
            debug!("Container never left TRANSFERING, previous owner's entries kept");
        }
        self.events.emit(KeelEvent::ContainerRemoved { key });
    }
}

/// Where CLEAN goes once the engine resource is gone.
fn resume_after_clean(container: &Container) -> State {
    if container.status.pending_delete {
        return State::PendingDelete;
    }

    let previous = container.status.previous;
    if previous != State::Clean && StatusMachine::global().can_transition(State::Clean, previous) {
        previous
    } else {
        State::Dead
    }
}
