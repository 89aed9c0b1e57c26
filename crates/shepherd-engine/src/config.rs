//! Engine-wide configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Settings shared by the supervisor and every command it manages.
///
/// Injected once at construction; commands hold it behind an `Arc`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Agent executable spawned for each command. Resolved against `PATH`
    /// unless it contains a path separator.
    pub agent_program: String,
    /// Interval between scheduling passes over the command set.
    pub tick_interval: Duration,
    /// Default directory for child log files, used when a spec does not
    /// name its own.
    pub log_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            agent_program: "shepherd-agent".to_string(),
            tick_interval: Duration::from_millis(100),
            log_dir: std::env::temp_dir().join("shepherd"),
        }
    }
}

impl EngineConfig {
    /// Override the agent executable (useful for tests and packaging).
    #[must_use]
    pub fn with_agent_program(mut self, program: impl Into<String>) -> Self {
        self.agent_program = program.into();
        self
    }

    /// Override the scheduling interval.
    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Override the default child log directory.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }
}
