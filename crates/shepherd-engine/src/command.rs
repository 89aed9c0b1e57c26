//! The per-command supervision state machine.
//!
//! A [`Command`] owns one agent transport at a time and tracks two
//! orthogonal state machines: the agent process itself, and the child the
//! agent supervises. All transitions are driven by explicit calls
//! (`start`, `stop`, `reset`, `quit_agent`) and by inbound protocol
//! messages; transport events for one command are handled strictly in
//! order by a single driver task.

use std::sync::{Arc, Weak};
use std::time::Instant;

use shepherd_core::{AgentMessage, CommandSpec, ControlMessage, ProcessState};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::events::{EventHub, SupervisionEvent};
use crate::ssh;
use crate::transport::{
    AgentEndpoint, SIGKILL, SIGTERM, TransportError, TransportEvent, resolve_executable,
};

/// Errors from command operations.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("Command '{id}' has an empty command line")]
    EmptyCommandLine { id: String },

    #[error("Could not find path of executable {program}")]
    AgentNotFound { program: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// High-level command condition for operator displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateInfo {
    /// Never ran yet.
    Todo,
    /// Restart attempts exhausted; disabled until `reset()`.
    GaveUp,
    /// One-shot command that has run.
    Done,
    /// Last run returned a nonzero exit code.
    Failed,
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Point-in-time copy of a command's observable state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CommandSnapshot {
    pub identifier: String,
    pub agent_state: ProcessState,
    pub child_state: ProcessState,
    pub enabled: bool,
    pub gave_up: bool,
    pub times_run: u32,
    pub times_tried: u32,
    pub child_pid: Option<u32>,
    pub exit_code: i32,
    pub lines_received: u64,
    pub info: StateInfo,
}

/// Mutable command bookkeeping, guarded by one lock per command.
struct CommandState {
    agent_state: ProcessState,
    child_state: ProcessState,
    enabled: bool,
    gave_up: bool,
    received_ready: bool,
    ssh_error_shown: bool,
    not_found_shown: bool,
    times_run: u32,
    times_tried: u32,
    current_retry_delay: std::time::Duration,
    next_attempt_at: Option<Instant>,
    child_pid: Option<u32>,
    exit_code: i32,
    lines_received: u64,
    endpoint: Option<AgentEndpoint>,
    spawned_at: Option<Instant>,
    kill_timer: Option<JoinHandle<()>>,
    quit_waiters: Vec<oneshot::Sender<()>>,
}

/// One supervised command: spec, agent transport, and the dual state
/// machine driving it.
pub struct Command {
    spec: CommandSpec,
    config: Arc<EngineConfig>,
    hub: EventHub,
    state: Mutex<CommandState>,
    /// Self-handle for the driver and timer tasks this command spawns.
    weak: Weak<Command>,
}

impl Command {
    /// Create a command from its spec. Fails when the spec has no command
    /// line to run.
    pub fn new(
        spec: CommandSpec,
        config: Arc<EngineConfig>,
        hub: EventHub,
    ) -> Result<Arc<Self>, CommandError> {
        if spec.command_line.trim().is_empty() {
            return Err(CommandError::EmptyCommandLine {
                id: spec.identifier.clone(),
            });
        }
        info!(
            id = %spec.identifier,
            command = %spec.command_line,
            host = spec.host.as_deref().unwrap_or("localhost"),
            "Creating command"
        );
        let state = CommandState {
            agent_state: ProcessState::Stopped,
            child_state: ProcessState::Stopped,
            enabled: spec.enabled,
            gave_up: false,
            received_ready: false,
            ssh_error_shown: false,
            not_found_shown: false,
            times_run: 0,
            times_tried: 0,
            current_retry_delay: spec.retry_delay,
            next_attempt_at: None,
            child_pid: None,
            exit_code: 0,
            lines_received: 0,
            endpoint: None,
            spawned_at: None,
            kill_timer: None,
            quit_waiters: Vec::new(),
        };
        Ok(Arc::new_cyclic(|weak| Self {
            spec,
            config,
            hub,
            state: Mutex::new(state),
            weak: weak.clone(),
        }))
    }

    /// The spec this command was registered with.
    pub const fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Unique identifier of this command.
    pub fn id(&self) -> &str {
        &self.spec.identifier
    }

    /// Current state of the agent process.
    pub async fn agent_state(&self) -> ProcessState {
        self.state.lock().await.agent_state
    }

    /// Current state of the supervised child.
    pub async fn child_state(&self) -> ProcessState {
        self.state.lock().await.child_state
    }

    /// Point-in-time copy of the command's observable state.
    pub async fn snapshot(&self) -> CommandSnapshot {
        let st = self.state.lock().await;
        CommandSnapshot {
            identifier: self.spec.identifier.clone(),
            agent_state: st.agent_state,
            child_state: st.child_state,
            enabled: st.enabled,
            gave_up: st.gave_up,
            times_run: st.times_run,
            times_tried: st.times_tried,
            child_pid: st.child_pid,
            exit_code: st.exit_code,
            lines_received: st.lines_received,
            info: Self::state_info(&st, &self.spec),
        }
    }

    fn state_info(st: &CommandState, spec: &CommandSpec) -> StateInfo {
        match st.child_state {
            ProcessState::Stopped => {
                if st.times_run == 0 {
                    StateInfo::Todo
                } else if st.gave_up {
                    StateInfo::GaveUp
                } else if !spec.respawn {
                    StateInfo::Done
                } else if st.exit_code != 0 && st.enabled {
                    StateInfo::Failed
                } else {
                    StateInfo::Stopped
                }
            }
            ProcessState::Starting => StateInfo::Starting,
            ProcessState::Running => StateInfo::Running,
            ProcessState::Stopping => StateInfo::Stopping,
        }
    }

    /// Whether the scheduler may call [`Command::start`] right now.
    ///
    /// True only for an enabled, non-given-up command whose retry time has
    /// passed and whose machines allow a start: either no agent is running
    /// (a fresh one will be spawned), or the agent is up, has reported
    /// `ready`, and its child is stopped.
    pub async fn is_eligible(&self) -> bool {
        let st = self.state.lock().await;
        if !st.enabled || st.gave_up {
            return false;
        }
        if let Some(at) = st.next_attempt_at
            && at > Instant::now()
        {
            return false;
        }
        if st.child_state != ProcessState::Stopped {
            return false;
        }
        match st.agent_state {
            ProcessState::Stopped => true,
            ProcessState::Running => st.received_ready,
            ProcessState::Starting | ProcessState::Stopping => false,
        }
    }

    /// Start the agent and its child if they are not running.
    ///
    /// When the agent is already up and its child is stopped, only the
    /// startup command sequence is re-sent. Mid-transition machines make
    /// this a logged no-op; the caller retries on a later tick. Failure to
    /// resolve the agent executable is a configuration error and is
    /// returned, never retried internally.
    pub async fn start(&self) -> Result<(), CommandError> {
        let mut st = self.state.lock().await;
        st.enabled = true;
        st.gave_up = false;
        if st.times_tried == 0 {
            st.current_retry_delay = self.spec.retry_delay;
        }
        st.times_tried += 1;

        if st.child_state == ProcessState::Running {
            debug!(id = %self.id(), "Child is already running");
            return Ok(());
        }
        if st.agent_state == ProcessState::Running && st.child_state == ProcessState::Stopped {
            self.send_startup_sequence(&mut st).await;
            return Ok(());
        }
        if st.child_state.is_transitional() {
            warn!(id = %self.id(), state = %st.child_state, "Cannot start child mid-transition");
            return Ok(());
        }
        if st.agent_state.is_transitional() {
            warn!(id = %self.id(), state = %st.agent_state, "Cannot start agent mid-transition");
            return Ok(());
        }

        // Agent is stopped: spawn a fresh one, then let `ready` trigger the
        // startup sequence.
        st.lines_received = 0;
        st.received_ready = false;

        let mut argv = self.build_agent_argv();
        let resolved =
            resolve_executable(&argv[0]).ok_or_else(|| CommandError::AgentNotFound {
                program: argv[0].clone(),
            })?;
        argv[0] = resolved.to_string_lossy().into_owned();

        info!(id = %self.id(), agent = %argv.join(" "), "Starting agent");
        let (endpoint, events) = AgentEndpoint::spawn(&argv, self.id())?;
        self.set_agent_state(&mut st, ProcessState::Starting);
        st.spawned_at = Some(Instant::now());
        st.endpoint = Some(endpoint);
        drop(st);

        if let Some(command) = self.weak.upgrade() {
            tokio::spawn(async move {
                command.drive(events).await;
            });
        }
        Ok(())
    }

    /// Tell the agent to stop its child and disable automatic restart.
    pub async fn stop(&self) {
        let mut st = self.state.lock().await;
        self.stop_locked(&mut st).await;
    }

    /// Clear the give-up flag and restore the base retry delay.
    pub async fn reset(&self) {
        let mut st = self.state.lock().await;
        Self::reset_retry(&mut st, &self.spec);
    }

    /// Send a liveness probe to the agent.
    pub async fn send_ping(&self) {
        let st = self.state.lock().await;
        self.send(&st, ControlMessage::Ping).await;
    }

    /// Gracefully tear the agent down.
    ///
    /// Sequences child-stop, SIGTERM, and SIGKILL with the configured
    /// escalation delay between steps. Calling again while the agent is
    /// still stopping escalates to SIGKILL immediately. The returned
    /// handle resolves exactly once, when the agent process is reaped;
    /// an already-stopped agent resolves it immediately.
    pub async fn quit_agent(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut st = self.state.lock().await;
        match st.agent_state {
            ProcessState::Stopped => {
                debug!(id = %self.id(), "Agent process is already stopped");
                let _ = tx.send(());
            }
            ProcessState::Stopping => {
                info!(id = %self.id(), "Agent already stopping, escalating to SIGKILL");
                st.quit_waiters.push(tx);
                self.signal_agent(&st, SIGKILL);
            }
            ProcessState::Running | ProcessState::Starting => {
                st.quit_waiters.push(tx);
                if matches!(
                    st.child_state,
                    ProcessState::Running | ProcessState::Starting
                ) {
                    // Stop the child first; follow up with SIGTERM once it
                    // had the escalation delay to wind down.
                    self.stop_locked(&mut st).await;
                    if let Some(command) = self.weak.upgrade() {
                        let delay = self.spec.kill_delay;
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            command.sigterm_agent().await;
                        });
                    }
                } else {
                    self.sigterm_locked(&mut st);
                }
            }
        }
        rx
    }

    // ---------------------------------------------------------------
    // Transport event handling (one driver task per agent, FIFO)
    // ---------------------------------------------------------------

    async fn drive(self: Arc<Self>, mut events: tokio::sync::mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => self.on_connected().await,
                TransportEvent::Stdout(line) => self.on_line(&line).await,
                TransportEvent::Exited(code) => {
                    self.on_exited(code).await;
                    break;
                }
            }
        }
    }

    async fn on_connected(&self) {
        let mut st = self.state.lock().await;
        if st.agent_state == ProcessState::Starting {
            self.set_agent_state(&mut st, ProcessState::Running);
        } else {
            error!(id = %self.id(), state = %st.agent_state, "Agent connected while not expecting it");
        }
    }

    async fn on_line(&self, line: &str) {
        let mut st = self.state.lock().await;

        // SSH transport faults arrive as plain text on the same stream and
        // must never be dispatched as protocol messages.
        if let Some(diagnosis) = ssh::classify_line(line, &self.spec) {
            error!(id = %self.id(), "SSH problem: {diagnosis}");
            if !st.ssh_error_shown {
                st.ssh_error_shown = true;
                self.hub.publish(SupervisionEvent::SshError {
                    id: self.id().to_string(),
                    message: diagnosis,
                });
            }
            return;
        }

        st.lines_received += 1;
        match AgentMessage::decode(line) {
            AgentMessage::Ready => {
                st.received_ready = true;
                if st.enabled && st.child_state == ProcessState::Stopped {
                    self.send_startup_sequence(&mut st).await;
                }
            }
            AgentMessage::Ok => trace!(id = %self.id(), "Agent acknowledged"),
            AgentMessage::NotFound => {
                error!(id = %self.id(), command = %self.spec.command_line, "Child command not found");
                if !st.not_found_shown {
                    st.not_found_shown = true;
                    self.hub.publish(SupervisionEvent::CommandNotFound {
                        id: self.id().to_string(),
                        command: self.spec.command_line.clone(),
                    });
                }
            }
            AgentMessage::ChildPid(pid) => {
                st.child_pid = Some(pid);
                info!(id = %self.id(), pid, "Child pid reported");
                self.hub.publish(SupervisionEvent::ChildPidReported {
                    id: self.id().to_string(),
                    pid,
                });
            }
            AgentMessage::State {
                state,
                running_secs,
            } => self.on_child_state(&mut st, state, running_secs),
            AgentMessage::Retval(code) => {
                st.exit_code = code;
                info!(id = %self.id(), code, "Child exit code");
            }
            AgentMessage::Msg(text) => debug!(id = %self.id(), "agent message: {text}"),
            AgentMessage::Log(text) => debug!(id = %self.id(), "agent log: {text}"),
            AgentMessage::Error(text) => error!(id = %self.id(), "agent error: {text}"),
            AgentMessage::Pong => trace!(id = %self.id(), "Agent is alive"),
            AgentMessage::Bye => info!(id = %self.id(), "Agent is exiting"),
            AgentMessage::Loopback { keyword } => {
                trace!(id = %self.id(), keyword, "Ignoring echoed control keyword");
            }
            AgentMessage::Unknown { keyword, rest } => {
                warn!(id = %self.id(), keyword, rest, "Unparsed line from agent");
            }
        }
    }

    fn on_child_state(
        &self,
        st: &mut CommandState,
        state: ProcessState,
        running_secs: Option<f64>,
    ) {
        debug!(id = %self.id(), %state, "Child state reported");
        if state == ProcessState::Stopped && st.enabled && self.spec.respawn {
            let run_time = running_secs.unwrap_or(0.0);
            if run_time < self.spec.minimum_lifetime.as_secs_f64() {
                info!(
                    id = %self.id(),
                    run_time,
                    minimum = self.spec.minimum_lifetime.as_secs_f64(),
                    "Child lived shorter than its minimum lifetime"
                );
                self.apply_retry_policy(st);
            }
        }
        if state == ProcessState::Stopped
            && st.child_state != ProcessState::Stopped
            && !self.spec.respawn
        {
            debug!(id = %self.id(), "One-shot run finished, disabling automatic restart");
            st.enabled = false;
        }
        self.set_child_state(st, state);
    }

    async fn on_exited(&self, exit_code: Option<i32>) {
        let mut st = self.state.lock().await;
        if let Some(at) = st.spawned_at.take() {
            debug!(id = %self.id(), uptime = ?at.elapsed(), "Agent lifetime");
        }
        match st.agent_state {
            ProcessState::Starting => {
                error!(id = %self.id(), "Agent died during startup");
            }
            ProcessState::Running => match exit_code {
                Some(0) => info!(id = %self.id(), "Agent exited"),
                Some(code) => warn!(id = %self.id(), code, "Agent exited with error"),
                None => warn!(id = %self.id(), "Agent killed by signal"),
            },
            ProcessState::Stopping => info!(id = %self.id(), "Agent exited as expected"),
            ProcessState::Stopped => {}
        }
        // The agent is gone, so its child can no longer be observed; force
        // both machines to their settled state.
        if st.child_state != ProcessState::Stopped {
            self.set_child_state(&mut st, ProcessState::Stopped);
        }
        self.set_agent_state(&mut st, ProcessState::Stopped);
        st.endpoint = None;
        st.received_ready = false;
        if let Some(timer) = st.kill_timer.take() {
            timer.abort();
        }
        for waiter in st.quit_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // ---------------------------------------------------------------
    // Protocol sends
    // ---------------------------------------------------------------

    async fn send_startup_sequence(&self, st: &mut CommandState) {
        self.send(st, ControlMessage::Do(self.spec.command_line.clone()))
            .await;
        self.send(
            st,
            ControlMessage::LogDir(self.log_dir().to_string_lossy().into_owned()),
        )
        .await;
        self.send(st, ControlMessage::Env(self.spec.format_env()))
            .await;
        info!(id = %self.id(), command = %self.spec.command_line, "Launching child");
        self.send(st, ControlMessage::Run).await;
        // The run instruction is on the wire; the child leaves Stopped now
        // so the scheduler cannot queue a second launch before the agent's
        // first state report arrives.
        self.set_child_state(st, ProcessState::Starting);
    }

    async fn send(&self, st: &CommandState, msg: ControlMessage) {
        if let Some(endpoint) = &st.endpoint {
            trace!(id = %self.id(), frame = %msg.encode(), "Sending control frame");
            if let Err(e) = endpoint.write_line(msg.encode()).await {
                warn!(id = %self.id(), error = %e, "Failed to send control frame");
            }
        } else {
            warn!(id = %self.id(), keyword = msg.keyword(), "No agent endpoint to send to");
        }
    }

    // ---------------------------------------------------------------
    // Policy and state transitions
    // ---------------------------------------------------------------

    async fn stop_locked(&self, st: &mut CommandState) {
        Self::reset_retry(st, &self.spec);
        st.enabled = false;
        if matches!(
            st.child_state,
            ProcessState::Running | ProcessState::Starting
        ) {
            info!(id = %self.id(), "Stopping child");
            self.send(st, ControlMessage::Stop).await;
        } else {
            warn!(id = %self.id(), state = %st.child_state, "Cannot stop child that is not running");
        }
    }

    fn reset_retry(st: &mut CommandState, spec: &CommandSpec) {
        st.gave_up = false;
        st.next_attempt_at = None;
        st.current_retry_delay = spec.retry_delay;
    }

    /// Called when a child run was too short to count: either give up for
    /// good, or push the next attempt out and double the delay.
    fn apply_retry_policy(&self, st: &mut CommandState) {
        if self.spec.give_up_after != 0 && st.times_tried > self.spec.give_up_after {
            st.gave_up = true;
            st.enabled = false;
            info!(id = %self.id(), attempts = st.times_tried, "Gave up restarting command");
            self.hub.publish(SupervisionEvent::GaveUp {
                id: self.id().to_string(),
            });
        } else {
            st.next_attempt_at = Some(Instant::now() + st.current_retry_delay);
            info!(
                id = %self.id(),
                delay = ?st.current_retry_delay,
                "Will wait before trying again"
            );
            st.current_retry_delay *= 2;
        }
    }

    fn set_agent_state(&self, st: &mut CommandState, new_state: ProcessState) {
        debug!(id = %self.id(), state = %new_state, "Agent state");
        if st.agent_state != new_state {
            st.agent_state = new_state;
            self.hub.publish(SupervisionEvent::AgentStateChanged {
                id: self.id().to_string(),
                state: new_state,
            });
        }
    }

    fn set_child_state(&self, st: &mut CommandState, new_state: ProcessState) {
        if new_state == ProcessState::Stopped {
            st.child_pid = None;
        }
        if st.child_state != new_state {
            if new_state == ProcessState::Running {
                st.times_run += 1;
            }
            st.child_state = new_state;
            self.hub.publish(SupervisionEvent::ChildStateChanged {
                id: self.id().to_string(),
                state: new_state,
            });
        }
    }

    // ---------------------------------------------------------------
    // Teardown signaling
    // ---------------------------------------------------------------

    async fn sigterm_agent(&self) {
        let mut st = self.state.lock().await;
        if matches!(
            st.agent_state,
            ProcessState::Running | ProcessState::Starting
        ) {
            self.sigterm_locked(&mut st);
        }
    }

    fn sigterm_locked(&self, st: &mut CommandState) {
        info!(id = %self.id(), "Sending SIGTERM to agent");
        self.signal_agent(st, SIGTERM);
        self.set_agent_state(st, ProcessState::Stopping);

        // Schedule the SIGKILL follow-up; cancelled if the agent exits on
        // its own first.
        if let Some(command) = self.weak.upgrade() {
            let delay = self.spec.kill_delay;
            let timer = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                command.sigkill_if_still_stopping().await;
            });
            if let Some(old) = st.kill_timer.replace(timer) {
                old.abort();
            }
        }
    }

    async fn sigkill_if_still_stopping(&self) {
        let st = self.state.lock().await;
        if st.agent_state == ProcessState::Stopping {
            info!(id = %self.id(), "Agent still alive after SIGTERM, sending SIGKILL");
            self.signal_agent(&st, SIGKILL);
        }
    }

    fn signal_agent(&self, st: &CommandState, signal: i32) {
        if let Some(endpoint) = &st.endpoint {
            if let Err(e) = endpoint.signal(signal) {
                warn!(id = %self.id(), signal, error = %e, "Failed to signal agent");
            }
        } else {
            debug!(id = %self.id(), signal, "No agent endpoint to signal");
        }
    }

    fn build_agent_argv(&self) -> Vec<String> {
        let mut argv = Vec::new();
        if let Some(host) = &self.spec.host {
            debug!(id = %self.id(), host = %host, "Using SSH transport");
            argv.push("ssh".to_string());
            if let Some(port) = self.spec.ssh_port {
                argv.push("-p".to_string());
                argv.push(port.to_string());
            }
            if let Some(user) = &self.spec.user {
                argv.push("-l".to_string());
                argv.push(user.clone());
            }
            argv.push(host.clone());
            argv.push(self.config.agent_program.clone());
        } else {
            argv.push(self.config.agent_program.clone());
        }
        argv.push("--id".to_string());
        argv.push(self.spec.identifier.clone());
        argv
    }

    fn log_dir(&self) -> std::path::PathBuf {
        self.spec
            .log_dir
            .clone()
            .unwrap_or_else(|| self.config.log_dir.clone())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn command(spec: CommandSpec) -> (Arc<Command>, EventHub) {
        let hub = EventHub::new();
        let config = Arc::new(EngineConfig::default());
        let command = Command::new(spec, config, hub.clone()).unwrap();
        (command, hub)
    }

    #[test]
    fn empty_command_line_is_rejected() {
        let hub = EventHub::new();
        let config = Arc::new(EngineConfig::default());
        let result = Command::new(CommandSpec::new("  ", "empty"), config, hub);
        assert!(matches!(
            result,
            Err(CommandError::EmptyCommandLine { .. })
        ));
    }

    #[tokio::test]
    async fn fresh_command_is_eligible() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "fresh"));
        assert!(command.is_eligible().await);
    }

    #[tokio::test]
    async fn disabled_command_is_not_eligible() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "off").disabled());
        assert!(!command.is_eligible().await);
    }

    #[tokio::test]
    async fn running_agent_requires_ready_for_eligibility() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "waiting"));
        {
            let mut st = command.state.lock().await;
            st.agent_state = ProcessState::Running;
        }
        assert!(!command.is_eligible().await);

        command.state.lock().await.received_ready = true;
        assert!(command.is_eligible().await);
    }

    #[tokio::test]
    async fn backoff_doubles_on_each_short_run() {
        let spec = CommandSpec::new("sleep 60", "flappy")
            .with_retry_delay(Duration::from_millis(100));
        let (command, _hub) = command(spec);

        let mut st = command.state.lock().await;
        command.apply_retry_policy(&mut st);
        assert_eq!(st.current_retry_delay, Duration::from_millis(200));
        assert!(st.next_attempt_at.is_some());

        command.apply_retry_policy(&mut st);
        assert_eq!(st.current_retry_delay, Duration::from_millis(400));

        command.apply_retry_policy(&mut st);
        assert_eq!(st.current_retry_delay, Duration::from_millis(800));
        assert!(!st.gave_up);
    }

    #[tokio::test]
    async fn gives_up_after_exceeding_attempts() {
        let spec = CommandSpec::new("sleep 60", "doomed").with_give_up_after(3);
        let (command, hub) = command(spec);
        let mut events = hub.subscribe();

        {
            let mut st = command.state.lock().await;
            st.times_tried = 4;
            command.apply_retry_policy(&mut st);
            assert!(st.gave_up);
            assert!(!st.enabled);
        }
        assert!(!command.is_eligible().await);
        assert_eq!(
            events.recv().await.unwrap(),
            SupervisionEvent::GaveUp {
                id: "doomed".into()
            }
        );
    }

    #[tokio::test]
    async fn zero_give_up_threshold_retries_forever() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "persistent"));
        let mut st = command.state.lock().await;
        st.times_tried = 1000;
        command.apply_retry_policy(&mut st);
        assert!(!st.gave_up);
    }

    #[tokio::test]
    async fn reset_restores_base_delay_and_clears_give_up() {
        let spec = CommandSpec::new("sleep 60", "revived")
            .with_retry_delay(Duration::from_millis(100));
        let (command, _hub) = command(spec);
        {
            let mut st = command.state.lock().await;
            st.gave_up = true;
            st.current_retry_delay = Duration::from_secs(30);
            st.next_attempt_at = Some(Instant::now() + Duration::from_secs(60));
        }
        command.reset().await;

        let st = command.state.lock().await;
        assert!(!st.gave_up);
        assert_eq!(st.current_retry_delay, Duration::from_millis(100));
        assert!(st.next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn short_lived_stop_triggers_backoff() {
        let spec = CommandSpec::new("sleep 60", "brief")
            .with_minimum_lifetime(Duration::from_secs(1));
        let (command, _hub) = command(spec);
        {
            let mut st = command.state.lock().await;
            st.child_state = ProcessState::Running;
            st.agent_state = ProcessState::Running;
        }
        command
            .on_line(&AgentMessage::State {
                state: ProcessState::Stopped,
                running_secs: Some(0.2),
            }
            .encode())
            .await;

        let st = command.state.lock().await;
        assert_eq!(st.child_state, ProcessState::Stopped);
        assert!(st.next_attempt_at.is_some(), "backoff should be armed");
    }

    #[tokio::test]
    async fn long_lived_stop_does_not_trigger_backoff() {
        let spec = CommandSpec::new("sleep 60", "solid")
            .with_minimum_lifetime(Duration::from_millis(500));
        let (command, _hub) = command(spec);
        {
            let mut st = command.state.lock().await;
            st.child_state = ProcessState::Running;
            st.agent_state = ProcessState::Running;
        }
        command.on_line("state stopped 10.0").await;

        let st = command.state.lock().await;
        assert!(st.next_attempt_at.is_none());
    }

    #[tokio::test]
    async fn one_shot_command_is_not_respawned() {
        let (command, _hub) = command(CommandSpec::new("echo done", "oneshot").once());
        {
            let mut st = command.state.lock().await;
            st.child_state = ProcessState::Running;
            st.agent_state = ProcessState::Running;
        }
        command.on_line("state stopped 0.01").await;

        let st = command.state.lock().await;
        assert!(st.next_attempt_at.is_none(), "one-shots never back off");
        assert!(!st.enabled, "a finished one-shot is not relaunched");
    }

    #[tokio::test]
    async fn child_pid_is_recorded_and_published() {
        let (command, hub) = command(CommandSpec::new("sleep 60", "pidful"));
        let mut events = hub.subscribe();

        command.on_line("child_pid 4242").await;
        assert_eq!(command.state.lock().await.child_pid, Some(4242));
        assert_eq!(
            events.recv().await.unwrap(),
            SupervisionEvent::ChildPidReported {
                id: "pidful".into(),
                pid: 4242,
            }
        );
    }

    #[tokio::test]
    async fn not_found_notifies_only_once() {
        let (command, hub) = command(CommandSpec::new("nonesuch", "ghost"));
        let mut events = hub.subscribe();

        command.on_line("not_found ").await;
        command.on_line("not_found ").await;

        assert!(matches!(
            events.recv().await.unwrap(),
            SupervisionEvent::CommandNotFound { .. }
        ));
        assert!(events.try_recv().is_err(), "second not_found must not notify");
    }

    #[tokio::test]
    async fn ssh_error_notifies_only_once() {
        let spec = CommandSpec::new("sleep 60", "remote").with_host("box.example");
        let (command, hub) = command(spec);
        let mut events = hub.subscribe();

        command.on_line("user@box.example's password:").await;
        command.on_line("user@box.example's password:").await;

        assert!(matches!(
            events.recv().await.unwrap(),
            SupervisionEvent::SshError { .. }
        ));
        assert!(events.try_recv().is_err(), "repeat SSH errors are suppressed");
        assert_eq!(
            command.state.lock().await.lines_received,
            0,
            "SSH fault lines are not dispatched"
        );
    }

    #[tokio::test]
    async fn unknown_keyword_is_dropped_without_state_change() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "tolerant"));
        command.on_line("frobnicate everything now").await;

        let st = command.state.lock().await;
        assert_eq!(st.child_state, ProcessState::Stopped);
        assert_eq!(st.lines_received, 1);
    }

    #[tokio::test]
    async fn child_state_invariant_holds_after_agent_exit() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "orphaned"));
        {
            let mut st = command.state.lock().await;
            st.agent_state = ProcessState::Running;
            st.child_state = ProcessState::Running;
        }
        command.on_exited(Some(1)).await;

        let st = command.state.lock().await;
        assert_eq!(st.agent_state, ProcessState::Stopped);
        assert_eq!(st.child_state, ProcessState::Stopped);
        assert!(st.endpoint.is_none());
    }

    #[tokio::test]
    async fn quit_agent_on_stopped_agent_resolves_immediately() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "idle"));
        let done = command.quit_agent().await;
        tokio::time::timeout(Duration::from_millis(100), done)
            .await
            .expect("completion should be immediate")
            .unwrap();
    }

    #[tokio::test]
    async fn entering_running_increments_run_counter_once() {
        let (command, _hub) = command(CommandSpec::new("sleep 60", "counted"));
        {
            let mut st = command.state.lock().await;
            st.agent_state = ProcessState::Running;
        }
        command.on_line("state running").await;
        command.on_line("state running").await;

        let st = command.state.lock().await;
        assert_eq!(st.times_run, 1, "repeated reports of the same state do not recount");
    }

    #[tokio::test]
    async fn state_info_reflects_lifecycle() {
        let (command, _hub) = command(CommandSpec::new("echo hi", "info").once());
        assert_eq!(command.snapshot().await.info, StateInfo::Todo);

        {
            let mut st = command.state.lock().await;
            st.times_run = 1;
        }
        assert_eq!(command.snapshot().await.info, StateInfo::Done);
    }
}
