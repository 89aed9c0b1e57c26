//! Shepherd Engine Library
//!
//! The per-process supervision engine:
//! - Agent transport endpoints (local or SSH-wrapped) with line-framed stdio
//! - The Command dual state machine driving the agent protocol
//! - Retry/backoff/give-up policy for crash-looping children
//! - The Supervisor fleet controller with dependency-ordered startup
//! - Typed supervision events for external listeners

pub mod command;
pub mod config;
pub mod events;
pub mod graph;
pub mod ssh;
pub mod supervisor;
pub mod transport;

pub use command::{Command, CommandError, CommandSnapshot, StateInfo};
pub use config::EngineConfig;
pub use events::{EventHub, SupervisionEvent};
pub use supervisor::{Supervisor, SupervisorError};
pub use transport::{AgentEndpoint, TransportError, TransportEvent};
