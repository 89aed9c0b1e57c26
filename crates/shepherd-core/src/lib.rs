//! Shepherd Core Library
//!
//! Shared functionality for Shepherd components:
//! - Process state machine vocabulary
//! - Command specifications (what to run, where, under which policy)
//! - Line-oriented wire protocol spoken between the engine and its agents
//! - Common error types

pub mod error;
pub mod spec;
pub mod state;
pub mod tracing_init;
pub mod wire;

pub use error::{Error, Result};
pub use spec::CommandSpec;
pub use state::ProcessState;
pub use wire::{AgentMessage, ControlMessage};
