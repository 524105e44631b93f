//! Event stream for listeners

use keel_types::{KeelEvent, KeelEventEnvelope, NodeId};
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcasts [`KeelEventEnvelope`]s; sending without subscribers is fine.
#[derive(Debug, Clone)]
pub struct EventBus {
    node: NodeId,
    tx: broadcast::Sender<KeelEventEnvelope>,
}

impl EventBus {
    pub fn new(node: NodeId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { node, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeelEventEnvelope> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: KeelEvent) {
        let envelope = KeelEventEnvelope::new(self.node, event);
        trace!(event_id = %envelope.id, "Emitting event");
        let _ = self.tx.send(envelope);
    }
}
