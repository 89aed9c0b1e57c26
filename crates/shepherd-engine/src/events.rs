//! Typed supervision events.
//!
//! The engine publishes state transitions and operator-actionable faults on
//! a broadcast channel. Listeners (dashboards, log shippers, tests)
//! subscribe before transitions occur; each event carries a fixed payload
//! shape. Slow subscribers lose the oldest events, never block the engine.

use serde::Serialize;
use shepherd_core::ProcessState;
use tokio::sync::broadcast;
use tracing::trace;

/// Broadcast buffer size for supervision events.
const EVENT_BUFFER: usize = 256;

/// One supervision event, published to all subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SupervisionEvent {
    /// The agent process of a command changed state.
    AgentStateChanged { id: String, state: ProcessState },
    /// The supervised child of a command changed state.
    ChildStateChanged { id: String, state: ProcessState },
    /// The agent reported the child's OS process id.
    ChildPidReported { id: String, pid: u32 },
    /// The child executable does not exist. Raised at most once per command;
    /// requires operator intervention.
    CommandNotFound { id: String, command: String },
    /// The SSH transport failed (auth, connectivity, missing agent).
    /// Raised at most once per command.
    SshError { id: String, message: String },
    /// The command exhausted its restart attempts and was disabled.
    GaveUp { id: String },
}

/// Publish/subscribe hub for [`SupervisionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<SupervisionEvent>,
}

impl EventHub {
    /// Create a hub with the default buffer size.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A hub with no subscribers drops it silently.
    pub fn publish(&self, event: SupervisionEvent) {
        trace!(?event, "publishing supervision event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
