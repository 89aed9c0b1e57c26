//! Process state vocabulary shared by the engine and the agent.
//!
//! Both the agent process and the child it supervises move through the same
//! four states. The engine tracks one machine per process, so a command
//! carries two `ProcessState` values at any time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised process (agent or child).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Not running.
    #[default]
    Stopped,
    /// Spawn requested, not yet confirmed alive.
    Starting,
    /// Alive and under supervision.
    Running,
    /// Termination requested, not yet reaped.
    Stopping,
}

impl ProcessState {
    /// Wire token for this state, as exchanged in `state` protocol lines.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }

    /// True while a transition is in flight (neither settled state).
    pub const fn is_transitional(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopping" => Ok(Self::Stopping),
            other => Err(crate::Error::UnknownState(other.to_string())),
        }
    }
}
