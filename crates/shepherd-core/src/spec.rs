//! Immutable command specifications.
//!
//! A [`CommandSpec`] describes one process the supervisor must keep alive:
//! what to run, where to run it (locally or over SSH), and under which
//! restart policy. Specs are created once at registration time and never
//! mutated; all runtime bookkeeping lives in the engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one supervised command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Shell command line. The first token is the executable.
    pub command_line: String,
    /// Unique key. Also used for the child log file name and the agent's
    /// `--id` argument, so avoid spaces and exotic characters.
    pub identifier: String,
    /// Environment overrides for the child process.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Host name or IP address, if the agent is spawned over SSH.
    #[serde(default)]
    pub host: Option<String>,
    /// User name for the SSH connection.
    #[serde(default)]
    pub user: Option<String>,
    /// SSH port, when not the default.
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Startup ordering hint for external tooling.
    #[serde(default)]
    pub order: Option<u32>,
    /// How long the supervisor waits after starting this command before
    /// evaluating further commands in the same scheduling pass.
    #[serde(default = "default_sleep_after")]
    pub sleep_after: Duration,
    /// Whether the child is restarted when it stops. `false` for one-shots.
    #[serde(default = "default_true")]
    pub respawn: bool,
    /// Minimum time a child must have lived for its run to count; shorter
    /// runs go through the retry/backoff policy.
    #[serde(default = "default_minimum_lifetime")]
    pub minimum_lifetime: Duration,
    /// Initial delay before retrying a crashed child. Doubles on each
    /// successive short-lived run.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
    /// Number of attempts after which the command is abandoned.
    /// 0 means retry forever.
    #[serde(default)]
    pub give_up_after: u32,
    /// Whether the supervisor may start this command at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Wait between SIGTERM and SIGKILL when tearing the agent down.
    #[serde(default = "default_kill_delay")]
    pub kill_delay: Duration,
    /// Identifiers this command depends on. The child is started only once
    /// every dependency's child is running.
    #[serde(default)]
    pub depends: Vec<String>,
    /// Directory for the child's log file. Engine default when unset.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_sleep_after() -> Duration {
    Duration::from_millis(250)
}

fn default_minimum_lifetime() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(250)
}

fn default_kill_delay() -> Duration {
    Duration::from_secs(8)
}

impl CommandSpec {
    /// Create a spec with default policy values.
    pub fn new(command_line: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            command_line: command_line.into(),
            identifier: identifier.into(),
            env: Vec::new(),
            host: None,
            user: None,
            ssh_port: None,
            order: None,
            sleep_after: default_sleep_after(),
            respawn: true,
            minimum_lifetime: default_minimum_lifetime(),
            retry_delay: default_retry_delay(),
            give_up_after: 0,
            enabled: true,
            kill_delay: default_kill_delay(),
            depends: Vec::new(),
            log_dir: None,
        }
    }

    /// Add an environment override for the child.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run the agent on a remote host over SSH.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// User name for the SSH connection.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// SSH port for the remote agent.
    #[must_use]
    pub const fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    /// Identifiers this command waits for before its child may start.
    #[must_use]
    pub fn with_depends(mut self, depends: Vec<String>) -> Self {
        self.depends = depends;
        self
    }

    /// Disable automatic restart (one-shot command).
    #[must_use]
    pub const fn once(mut self) -> Self {
        self.respawn = false;
        self
    }

    /// Post-start delay applied by the scheduler.
    #[must_use]
    pub const fn with_sleep_after(mut self, delay: Duration) -> Self {
        self.sleep_after = delay;
        self
    }

    /// Minimum lifetime for a run to count as valid.
    #[must_use]
    pub const fn with_minimum_lifetime(mut self, lifetime: Duration) -> Self {
        self.minimum_lifetime = lifetime;
        self
    }

    /// Initial retry delay (doubles on each short-lived run).
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Give up after this many attempts (0 = never).
    #[must_use]
    pub const fn with_give_up_after(mut self, attempts: u32) -> Self {
        self.give_up_after = attempts;
        self
    }

    /// Register the command disabled.
    #[must_use]
    pub const fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// SIGTERM-to-SIGKILL escalation delay for agent teardown.
    #[must_use]
    pub const fn with_kill_delay(mut self, delay: Duration) -> Self {
        self.kill_delay = delay;
        self
    }

    /// Directory for the child's log file.
    #[must_use]
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// True when the agent must be reached over SSH.
    pub const fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    /// Environment overrides as space-joined `KEY=VALUE` pairs, the form the
    /// `env` protocol line carries.
    pub fn format_env(&self) -> String {
        let mut txt = String::new();
        for (key, value) in &self.env {
            txt.push_str(key);
            txt.push('=');
            txt.push_str(value);
            txt.push(' ');
        }
        txt
    }
}
