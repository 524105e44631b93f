//! Event types for Keel observability
//!
//! Listeners subscribe to a broadcast stream of envelopes; every transition
//! and every notable failure is published here as well as logged.

use crate::ids::{ContainerKey, NodeId};
use crate::status::State;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all Keel events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeelEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Node that emitted the event
    pub node: NodeId,

    pub severity: EventSeverity,

    pub event: KeelEvent,
}

impl KeelEventEnvelope {
    pub fn new(node: NodeId, event: KeelEvent) -> Self {
        let severity = event.default_severity();
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            node,
            severity,
            event,
        }
    }
}

/// Event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Keel events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeelEvent {
    /// A container moved to a new state
    StateChanged {
        key: ContainerKey,
        from: State,
        to: State,
    },

    /// The reconciler asked for a transition the graph does not allow
    TransitionRejected {
        key: ContainerKey,
        from: State,
        to: State,
    },

    /// Crash-loop threshold exceeded
    CrashLoop { key: ContainerKey, failures: u32 },

    /// Watcher finished teardown and the container left the registry
    ContainerRemoved { key: ContainerKey },
}

impl KeelEvent {
    fn default_severity(&self) -> EventSeverity {
        match self {
            KeelEvent::StateChanged { to, .. } => match to {
                State::DaemonFailure | State::Backoff | State::InitFailed => EventSeverity::Error,
                State::Dead | State::ReadinessFailed | State::DependsFailed => {
                    EventSeverity::Warning
                }
                _ => EventSeverity::Info,
            },
            KeelEvent::TransitionRejected { .. } => EventSeverity::Warning,
            KeelEvent::CrashLoop { .. } => EventSeverity::Error,
            KeelEvent::ContainerRemoved { .. } => EventSeverity::Info,
        }
    }

    pub fn key(&self) -> &ContainerKey {
        match self {
            KeelEvent::StateChanged { key, .. }
            | KeelEvent::TransitionRejected { key, .. }
            | KeelEvent::CrashLoop { key, .. }
            | KeelEvent::ContainerRemoved { key } => key,
        }
    }
}
