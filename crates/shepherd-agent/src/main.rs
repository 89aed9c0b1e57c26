//! Shepherd Agent
//!
//! The intermediary process the engine spawns per supervised command,
//! locally or at the far end of an SSH connection. It reads control frames
//! from stdin, launches and monitors the actual child, mirrors the child's
//! output into a log file, and reports state transitions, PID, and exit
//! code on stdout. Stdout is reserved for the protocol; diagnostics go to
//! stderr.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use shepherd_core::{AgentMessage, ControlMessage, ProcessState};

/// Exit code `sh` reports when the command to run does not exist.
const SHELL_NOT_FOUND: i32 = 127;

/// Grace period for the child after SIGTERM during agent shutdown.
const CHILD_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "shepherd-agent")]
#[command(version, about = "Shepherd agent - supervises one child process")]
struct Args {
    /// Identifier of the supervised command; names the child log file.
    #[arg(long, env = "SHEPHERD_AGENT_ID")]
    id: String,

    /// Log level filter for agent diagnostics on stderr.
    #[arg(long, default_value = "info", env = "SHEPHERD_AGENT_LOG_LEVEL")]
    log_level: String,

    /// Output diagnostics as JSON.
    #[arg(long, env = "SHEPHERD_AGENT_LOG_JSON")]
    log_json: bool,
}

/// Notification from the child monitor task.
#[derive(Debug)]
struct ChildExit {
    code: Option<i32>,
    ran_for: Duration,
}

struct Agent {
    id: String,
    command_line: Option<String>,
    env: Vec<(String, String)>,
    log_dir: PathBuf,
    child_pid: Option<u32>,
    exit_tx: mpsc::Sender<ChildExit>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    shepherd_core::tracing_init::init_tracing_stderr(
        &format!("shepherd_agent={}", args.log_level),
        args.log_json,
    );
    info!(id = %args.id, version = env!("CARGO_PKG_VERSION"), "Agent starting");

    let (exit_tx, exit_rx) = mpsc::channel(4);
    let agent = Agent {
        id: args.id,
        command_line: None,
        env: Vec::new(),
        log_dir: std::env::temp_dir().join("shepherd"),
        child_pid: None,
        exit_tx,
    };
    agent.run(exit_rx).await;
    Ok(())
}

impl Agent {
    async fn run(mut self, mut exit_rx: mpsc::Receiver<ChildExit>) {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        #[cfg(unix)]
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                emit(&AgentMessage::Bye);
                return;
            }
        };
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();
        tokio::pin!(sigterm_future);

        // Setup complete: the engine may send startup commands now.
        emit(&AgentMessage::Ready);

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) | Err(_) => {
                        info!(id = %self.id, "Engine closed stdin");
                        break;
                    }
                },
                Some(exit) = exit_rx.recv() => self.on_child_exit(&exit),
                _ = &mut sigterm_future => {
                    info!(id = %self.id, "Received SIGTERM");
                    break;
                }
            }
        }

        self.shutdown(&mut exit_rx).await;
    }

    fn handle_line(&mut self, line: &str) {
        match ControlMessage::decode(line) {
            Ok(ControlMessage::Do(command_line)) => {
                debug!(id = %self.id, command = %command_line, "Command line set");
                self.command_line = Some(command_line);
                emit(&AgentMessage::Ok);
            }
            Ok(ControlMessage::Env(pairs)) => {
                self.env = parse_env(&pairs);
                emit(&AgentMessage::Ok);
            }
            Ok(ControlMessage::LogDir(dir)) => {
                self.log_dir = PathBuf::from(dir);
                emit(&AgentMessage::Ok);
            }
            Ok(ControlMessage::Run) => self.launch(),
            Ok(ControlMessage::Stop) => self.stop_child(),
            Ok(ControlMessage::Ping) => emit(&AgentMessage::Pong),
            Err(e) => {
                warn!(id = %self.id, line, "Dropping unparsable control line");
                emit(&AgentMessage::Error(e.to_string()));
            }
        }
    }

    /// Launch the configured child through the shell.
    fn launch(&mut self) {
        if self.child_pid.is_some() {
            emit(&AgentMessage::Msg("child is already running".to_string()));
            return;
        }
        let Some(command_line) = self.command_line.clone() else {
            emit(&AgentMessage::Error("no command line set".to_string()));
            return;
        };

        emit(&AgentMessage::State {
            state: ProcessState::Starting,
            running_secs: None,
        });

        let log_file = self.open_log_file();
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&command_line)
            .envs(self.env.iter().cloned())
            .stdin(Stdio::null());
        match &log_file {
            Some(file) => {
                match (file.try_clone(), file.try_clone()) {
                    (Ok(out), Ok(err)) => {
                        command.stdout(out).stderr(err);
                    }
                    _ => {
                        command.stdout(Stdio::null()).stderr(Stdio::null());
                    }
                }
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        match command.spawn() {
            Ok(mut child) => {
                let started = Instant::now();
                self.child_pid = child.id();
                if let Some(pid) = self.child_pid {
                    emit(&AgentMessage::ChildPid(pid));
                }
                emit(&AgentMessage::State {
                    state: ProcessState::Running,
                    running_secs: None,
                });
                info!(id = %self.id, pid = ?self.child_pid, "Child launched");

                let exit_tx = self.exit_tx.clone();
                tokio::spawn(async move {
                    let status = child.wait().await;
                    let code = status.ok().and_then(|s| s.code());
                    let _ = exit_tx
                        .send(ChildExit {
                            code,
                            ran_for: started.elapsed(),
                        })
                        .await;
                });
            }
            Err(e) => {
                warn!(id = %self.id, error = %e, "Failed to spawn child");
                if e.kind() == std::io::ErrorKind::NotFound {
                    emit(&AgentMessage::NotFound);
                } else {
                    emit(&AgentMessage::Error(format!("spawn failed: {e}")));
                }
                emit(&AgentMessage::State {
                    state: ProcessState::Stopped,
                    running_secs: Some(0.0),
                });
            }
        }
    }

    fn on_child_exit(&mut self, exit: &ChildExit) {
        info!(id = %self.id, code = ?exit.code, ran_for = ?exit.ran_for, "Child exited");
        self.child_pid = None;
        if exit.code == Some(SHELL_NOT_FOUND) {
            emit(&AgentMessage::NotFound);
        }
        emit(&AgentMessage::Retval(exit.code.unwrap_or(-1)));
        emit(&AgentMessage::State {
            state: ProcessState::Stopped,
            running_secs: Some(exit.ran_for.as_secs_f64()),
        });
    }

    fn stop_child(&mut self) {
        if let Some(pid) = self.child_pid {
            info!(id = %self.id, pid, "Stopping child");
            emit(&AgentMessage::State {
                state: ProcessState::Stopping,
                running_secs: None,
            });
            signal_pid(pid, term_signal());
        } else {
            emit(&AgentMessage::Msg("no child to stop".to_string()));
        }
    }

    /// Terminate the child (if any) before exiting, so it is never left
    /// orphaned behind a dead agent.
    async fn shutdown(&mut self, exit_rx: &mut mpsc::Receiver<ChildExit>) {
        if let Some(pid) = self.child_pid {
            info!(id = %self.id, pid, "Shutting down with live child");
            signal_pid(pid, term_signal());
            match tokio::time::timeout(CHILD_SHUTDOWN_GRACE, exit_rx.recv()).await {
                Ok(Some(exit)) => self.on_child_exit(&exit),
                Ok(None) | Err(_) => {
                    warn!(id = %self.id, pid, "Child ignored SIGTERM, killing");
                    signal_pid(pid, kill_signal());
                }
            }
        }
        emit(&AgentMessage::Bye);
    }

    fn open_log_file(&self) -> Option<std::fs::File> {
        if let Err(e) = std::fs::create_dir_all(&self.log_dir) {
            emit(&AgentMessage::Error(format!(
                "cannot create log directory {}: {e}",
                self.log_dir.display()
            )));
            return None;
        }
        let path = self.log_dir.join(format!("child-{}.log", self.id));
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                emit(&AgentMessage::Error(format!(
                    "cannot open log file {}: {e}",
                    path.display()
                )));
                None
            }
        }
    }
}

/// Write one protocol frame to stdout and flush; stdout is block-buffered
/// behind a pipe, and the engine reacts per line.
fn emit(msg: &AgentMessage) {
    use std::io::Write;
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "{}", msg.encode());
    let _ = out.flush();
}

/// Parse space-joined `KEY=VALUE` pairs from an `env` frame.
fn parse_env(pairs: &str) -> Vec<(String, String)> {
    pairs
        .split_whitespace()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

const fn term_signal() -> i32 {
    #[cfg(unix)]
    {
        libc::SIGTERM
    }
    #[cfg(not(unix))]
    {
        15
    }
}

const fn kill_signal() -> i32 {
    #[cfg(unix)]
    {
        libc::SIGKILL
    }
    #[cfg(not(unix))]
    {
        9
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: i32) {
    // SAFETY: pid was obtained from our own Child handle. kill(2) on an
    // owned subprocess is safe; a stale pid yields ESRCH, which we log.
    #[allow(unsafe_code)]
    #[allow(clippy::cast_possible_wrap)]
    let ret = unsafe { libc::kill(pid as i32, signal) };
    if ret != 0 {
        warn!(pid, signal, error = %std::io::Error::last_os_error(), "Failed to signal child");
    }
}

#[cfg(not(unix))]
fn signal_pid(pid: u32, signal: i32) {
    warn!(pid, signal, "Signals unsupported on this platform");
}
