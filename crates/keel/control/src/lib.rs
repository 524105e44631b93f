//! Keel Control - Per-container control loops
//!
//! Every managed container gets its own watcher task. The watcher
//! owns a cancellable lifetime, a periodic timer and the channels that feed the
//! [`Reconciler`], which advances the container through its state machine one
//! step at a time, calling out to the engine, the dependency gate and the
//! readiness prober.
//!
//! [`Node`] is the entry point: it applies definitions (running the replica
//! scheduler), routes external events to watchers and mirrors containers owned
//! by other nodes as ghosts.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod node;
pub mod reconciler;
mod watcher;

pub use config::NodeConfig;
pub use error::{ControlError, Result};
pub use events::EventBus;
pub use hooks::Hooks;
pub use node::{Collaborators, Node};
pub use reconciler::{Reconciler, Step};
pub use watcher::ExternalEvent;
