//! Per-container control loop
//!
//! A watcher task selects over its lifetime token, the enqueue, pause and
//! delete channels and a periodic timer. Reconciliation chains run as separate
//! tasks so the loop stays responsive while a chain waits on dependencies or
//! readiness; an atomic gate keeps at most one chain alive per container.

use keel_engine::EngineEvent;
use keel_health::ProgressMessage;
use keel_types::{Container, ContainerDefinition, ContainerId, ContainerKey, Runtime, State, Status};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::error::{ControlError, Result};
use crate::reconciler::Reconciler;

/// Consecutive "stay and continue" steps before a chain yields to the timer.
const MAX_IDLE_STEPS: usize = 16;

/// Event delivered to a running watcher from outside its control loop
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalEvent {
    /// A definition was applied again; a changed spec restarts from CREATED
    Apply(Box<ContainerDefinition>),

    /// Reset BACKOFF, DAEMON_FAILURE or INIT_FAILED
    Retry,

    /// Kill a running container so it is started again
    Restart,

    /// The runtime reported something about the container
    Engine(EngineEvent),
}

#[derive(Debug)]
pub(crate) enum Trigger {
    Reconcile,
    Event(ExternalEvent),
}

/// Receivers of the helper task currently running for this container
#[derive(Debug, Default)]
pub(crate) struct Slots {
    pub(crate) depends: Option<mpsc::Receiver<ProgressMessage>>,
    pub(crate) readiness: Option<mpsc::Receiver<ProgressMessage>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Commit {
    Moved,
    Stayed,
    Rejected,
    /// Something outside the chain changed the state during the step
    Superseded,
}

pub(crate) struct WatcherShared {
    id: ContainerId,
    key: ContainerKey,
    container: Mutex<Container>,
    pub(crate) slots: Mutex<Slots>,

    lifetime: CancellationToken,

    /// Child of `lifetime` handed to helper tasks; replaced on every interrupt
    run: Mutex<CancellationToken>,

    reconciling: AtomicBool,
    pending: AtomicBool,

    /// False while the container waits in TRANSFERING for its previous owner;
    /// until then the registry and store entries under this key are the peer's
    claimed: AtomicBool,
    timer_stopped: AtomicBool,
    torn_down: AtomicBool,
    idle: Notify,
    finished: CancellationToken,

    reconciler: Arc<Reconciler>,
    span: Span,
}

impl WatcherShared {
    pub(crate) fn key(&self) -> &ContainerKey {
        &self.key
    }

    /// Ends the watcher's lifetime; teardown follows in the watcher task.
    pub(crate) fn cancel(&self) {
        self.lifetime.cancel();
    }

    /// Wake a chain blocked on a helper task so it re-reads the state.
    /// Callers holding the container lock keep the lock order container, run, slots.
    async fn interrupt(&self) {
        let mut run = self.run.lock().await;
        run.cancel();
        *run = self.lifetime.child_token();
        let mut slots = self.slots.lock().await;
        slots.depends = None;
        slots.readiness = None;
    }

    /// Store the runtime produced by the pre-run hook, unless the state moved on.
    pub(crate) async fn update_runtime(&self, expected: State, runtime: Runtime) -> bool {
        let mut container = self.container.lock().await;
        if container.status.state != expected {
            return false;
        }
        container.runtime = runtime;
        true
    }

    fn acquire(&self) -> bool {
        self.reconciling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Start a reconciliation chain, or remember to run one more after the
    /// current chain ends.
    fn trigger(self: &Arc<Self>) {
        if self.lifetime.is_cancelled() {
            return;
        }

        self.pending.store(true, Ordering::SeqCst);
        if self.acquire() {
            self.pending.store(false, Ordering::SeqCst);
            let shared = Arc::clone(self);
            tokio::spawn(shared.chain().instrument(self.span.clone()));
        }
    }

    async fn chain(self: Arc<Self>) {
        loop {
            {
                let _gate = GateGuard { shared: &self };
                self.run_chain().await;
            }

            if self.lifetime.is_cancelled() || !self.pending.swap(false, Ordering::SeqCst) {
                break;
            }
            if !self.acquire() {
                break;
            }
        }
    }

    async fn run_chain(&self) {
        let mut idle_steps = 0;

        loop {
            if self.lifetime.is_cancelled() {
                return;
            }

            let (container, run) = {
                let mut container = self.container.lock().await;
                container.status.reconciling = true;
                let run = self.run.lock().await.clone();
                (container.clone(), run)
            };
            let current = container.status.state;

            let step = self.reconciler.reconcile(self, &run, container).await;
            let commit = self.commit(current, step.next).await;

            if self.lifetime.is_cancelled() {
                return;
            }

            match commit {
                Commit::Superseded => idle_steps = 0,
                Commit::Moved if step.proceed => idle_steps = 0,
                Commit::Stayed if step.proceed && idle_steps < MAX_IDLE_STEPS => idle_steps += 1,
                _ => return,
            }
        }
    }

    async fn commit(&self, current: State, next: State) -> Commit {
        let (commit, container) = {
            let mut container = self.container.lock().await;
            let commit = if container.status.state != current {
                Commit::Superseded
            } else if next == current {
                container.status.reconciling = false;
                Commit::Stayed
            } else if container.status.transition(next) {
                stamp(&mut container.status);
                Commit::Moved
            } else {
                container.status.reconciling = false;
                Commit::Rejected
            };
            (commit, container.clone())
        };

        match commit {
            Commit::Moved => self.reconciler.entered(&container, current),
            Commit::Rejected => self.reconciler.rejected(&container, next),
            Commit::Stayed | Commit::Superseded => {}
        }

        if container.status.is_end() {
            self.timer_stopped.store(true, Ordering::SeqCst);
        }
        if !self.lifetime.is_cancelled() {
            self.publish(&container).await;
        }
        commit
    }

    async fn publish(&self, container: &Container) {
        if container.status.state == State::Created {
            self.claimed.store(true, Ordering::SeqCst);
        }
        if self.claimed.load(Ordering::SeqCst) {
            self.reconciler.publish(container).await;
        }
    }

    /// Move to `dest` from outside the chain, then wake the chain. Already
    /// being in `dest` only wakes the chain.
    async fn force(self: &Arc<Self>, dest: State) {
        let (moved, from, container) = {
            let mut container = self.container.lock().await;
            let from = container.status.state;
            if from == dest {
                drop(container);
                self.trigger();
                return;
            }
            let moved = container.status.transition(dest);
            if moved {
                stamp(&mut container.status);
                self.interrupt().await;
            }
            (moved, from, container.clone())
        };

        if moved {
            self.timer_stopped.store(container.status.is_end(), Ordering::SeqCst);
            self.reconciler.entered(&container, from);
            self.publish(&container).await;
        } else {
            self.reconciler.rejected(&container, dest);
        }
        self.trigger();
    }

    async fn handle(self: &Arc<Self>, trigger: Trigger) {
        let event = match trigger {
            Trigger::Reconcile => {
                self.trigger();
                return;
            }
            Trigger::Event(event) => event,
        };

        let state = {
            let mut container = self.container.lock().await;
            if let ExternalEvent::Apply(definition) = &event {
                if container.definition == **definition {
                    drop(container);
                    self.trigger();
                    return;
                }
                info!("Definition changed");
                container.definition = (**definition).clone();
            }
            container.status.state
        };

        let dest = match (&event, state) {
            (ExternalEvent::Apply(_), State::Transfering) => None,
            (ExternalEvent::Apply(_), _) => Some(State::Created),
            (ExternalEvent::Retry, State::Backoff | State::DaemonFailure | State::InitFailed) => {
                self.reconciler.reset_failures(&self.key);
                Some(State::Created)
            }
            (ExternalEvent::Restart, State::Running) => Some(State::Kill),
            (ExternalEvent::Engine(EngineEvent::Died), State::Running) => Some(State::Dead),
            (event, state) => {
                debug!(?event, %state, "Event does not apply in current state");
                None
            }
        };

        match dest {
            Some(dest) => self.force(dest).await,
            None => self.trigger(),
        }
    }

    async fn request_delete(self: &Arc<Self>) {
        let already = {
            let mut container = self.container.lock().await;
            let already = container.status.pending_delete;
            container.status.pending_delete = true;
            already
        };

        if !already {
            info!("Delete requested");
            self.force(State::PendingDelete).await;
        } else {
            self.trigger();
        }
    }

    /// Runs once: waits out the active chain, then drops the container from
    /// the registry and the store.
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        loop {
            let notified = self.idle.notified();
            if self.acquire() {
                break;
            }
            notified.await;
        }

        self.interrupt().await;
        let container = self.container.lock().await.clone();
        self.reconciler
            .removed(&container, self.claimed.load(Ordering::SeqCst))
            .await;

        info!("Watcher stopped");
        self.finished.cancel();
    }

    async fn event_loop(
        self: Arc<Self>,
        interval: Duration,
        mut enqueue_rx: mpsc::Receiver<Trigger>,
        mut pause_rx: mpsc::Receiver<bool>,
        mut delete_rx: mpsc::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut paused = false;

        info!(index = self.id.index, "Watcher started");
        self.trigger();

        loop {
            tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => break,
                Some(()) = delete_rx.recv() => self.request_delete().await,
                Some(pause) = pause_rx.recv() => {
                    if pause != paused {
                        info!(paused = pause, "Periodic reconciliation toggled");
                    }
                    paused = pause;
                }
                Some(trigger) = enqueue_rx.recv() => self.handle(trigger).await,
                _ = ticker.tick(), if !paused && !self.timer_stopped.load(Ordering::SeqCst) => self.trigger(),
            }
        }

        self.teardown().await;
    }
}

struct GateGuard<'a> {
    shared: &'a WatcherShared,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.shared.reconciling.store(false, Ordering::SeqCst);
        self.shared.idle.notify_waiters();
    }
}

/// Timestamps recorded on entering a state.
fn stamp(status: &mut Status) {
    match status.state {
        State::DependsSolved => status.depends_solved_at = Some(status.last_update),
        State::Ready => status.ready_at = Some(status.last_update),
        _ => {}
    }
}

/// Handle to a running watcher; cloning it does not duplicate the watcher.
#[derive(Clone)]
pub(crate) struct WatcherHandle {
    shared: Arc<WatcherShared>,
    enqueue: mpsc::Sender<Trigger>,
    pause: mpsc::Sender<bool>,
    delete: mpsc::Sender<()>,
}

impl WatcherHandle {
    /// Spawn the watcher task for `container`. `on_exit` runs after teardown.
    pub(crate) fn spawn<F>(
        container: Container,
        parent: &CancellationToken,
        reconciler: Arc<Reconciler>,
        on_exit: F,
    ) -> Self
    where
        F: FnOnce(&Arc<WatcherShared>) + Send + 'static,
    {
        let capacity = reconciler.config().channel_capacity.max(1);
        let interval = reconciler.config().reconcile_interval();
        let key = container.key();
        let lifetime = parent.child_token();
        let span = info_span!("container", group = %key.group, name = %key.name);
        let claimed = container.status.state != State::Transfering;

        let shared = Arc::new(WatcherShared {
            id: container.id.clone(),
            key,
            container: Mutex::new(container),
            slots: Mutex::new(Slots::default()),
            run: Mutex::new(lifetime.child_token()),
            lifetime,
            reconciling: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            claimed: AtomicBool::new(claimed),
            timer_stopped: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            idle: Notify::new(),
            finished: CancellationToken::new(),
            reconciler,
            span,
        });

        let (enqueue, enqueue_rx) = mpsc::channel(capacity);
        let (pause, pause_rx) = mpsc::channel(capacity);
        let (delete, delete_rx) = mpsc::channel(1);

        let task = Arc::clone(&shared);
        let span = shared.span.clone();
        tokio::spawn(
            async move {
                Arc::clone(&task).event_loop(interval, enqueue_rx, pause_rx, delete_rx).await;
                on_exit(&task);
            }
            .instrument(span),
        );

        Self {
            shared,
            enqueue,
            pause,
            delete,
        }
    }

    pub(crate) fn id(&self) -> &ContainerId {
        &self.shared.id
    }

    pub(crate) fn is(&self, shared: &Arc<WatcherShared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    pub(crate) async fn container(&self) -> Container {
        self.shared.container.lock().await.clone()
    }

    pub(crate) async fn is_pending_delete(&self) -> bool {
        self.shared.container.lock().await.status.pending_delete
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.shared.finished.is_cancelled()
    }

    /// Ask for a reconciliation; a full queue already holds one.
    pub(crate) fn enqueue(&self) -> Result<()> {
        match self.enqueue.try_send(Trigger::Reconcile) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    pub(crate) async fn send(&self, event: ExternalEvent) -> Result<()> {
        self.enqueue
            .send(Trigger::Event(event))
            .await
            .map_err(|_| self.closed())
    }

    pub(crate) async fn set_paused(&self, paused: bool) -> Result<()> {
        self.pause.send(paused).await.map_err(|_| self.closed())
    }

    /// Request deletion and wait up to `timeout` for teardown.
    pub(crate) async fn delete(&self, timeout: Duration) -> Result<()> {
        if !self.is_finished() {
            // Full means a delete is already queued, closed means teardown began
            let _ = self.delete.try_send(());
        }
        self.wait_finished(timeout).await
    }

    pub(crate) async fn wait_finished(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.shared.finished.cancelled())
            .await
            .map_err(|_| {
                warn!(container = %self.shared.key, ?timeout, "Teardown did not finish in time");
                ControlError::DeleteTimeout {
                    key: self.shared.key.clone(),
                    timeout,
                }
            })
    }

    /// Stop the watcher without driving the container through deletion.
    pub(crate) fn cancel(&self) {
        self.shared.cancel();
    }

    fn closed(&self) -> ControlError {
        ControlError::WatcherClosed(self.shared.key.clone())
    }
}
