//! Agent transport endpoints.
//!
//! An [`AgentEndpoint`] owns one OS process (the agent, spawned directly or
//! through `ssh`), its standard streams, and signal delivery. It re-frames
//! the agent's arbitrarily chunked stdout into discrete lines and delivers
//! them, together with spawn and exit notifications, on an ordered event
//! channel. No policy lives here.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Graceful termination request for the agent.
#[cfg(unix)]
pub const SIGTERM: i32 = libc::SIGTERM;
#[cfg(not(unix))]
pub const SIGTERM: i32 = 15;

/// Forced kill for an agent that ignored SIGTERM.
#[cfg(unix)]
pub const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
pub const SIGKILL: i32 = 9;

/// Buffer size for the transport event channel.
const EVENT_BUFFER: usize = 64;

/// Buffer size for the stdin writer channel.
const STDIN_BUFFER: usize = 32;

/// Notifications delivered by an endpoint, in order: `Connected` first,
/// then any number of `Stdout` lines, then exactly one `Exited`.
#[derive(Debug)]
pub enum TransportEvent {
    /// The agent process was spawned and its streams are attached.
    Connected,
    /// One line of agent stdout (never empty).
    Stdout(String),
    /// The agent process was reaped. `None` when killed by a signal.
    Exited(Option<i32>),
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to spawn agent process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Failed to capture agent {stream}")]
    StdioUnavailable { stream: &'static str },

    #[error("Agent stdin is closed")]
    Closed,

    #[error("Failed to signal agent: {reason}")]
    SignalFailed { reason: String },
}

/// Handle to a running agent process.
#[derive(Debug)]
pub struct AgentEndpoint {
    stdin_tx: mpsc::Sender<String>,
    pid: Option<u32>,
}

impl AgentEndpoint {
    /// Spawn the agent described by `argv` (first element must be an
    /// absolute path, see [`resolve_executable`]) and return the endpoint
    /// together with its ordered event stream.
    ///
    /// The agent inherits the full parent environment: SSH key agents and
    /// `PATH` lookups on the remote side depend on it.
    pub fn spawn(
        argv: &[String],
        identifier: &str,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| TransportError::SpawnFailed {
                reason: "empty argv".to_string(),
            })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::SpawnFailed {
                reason: e.to_string(),
            })?;

        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or(TransportError::StdioUnavailable { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(TransportError::StdioUnavailable { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TransportError::StdioUnavailable { stream: "stderr" })?;

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(EVENT_BUFFER);
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(STDIN_BUFFER);

        // The channel is fresh, so the connection notice cannot be rejected.
        let _ = event_tx.try_send(TransportEvent::Connected);

        // Stdin writer task
        let id = identifier.to_string();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(id = %id, error = %e, "Failed to write to agent stdin");
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Stdout reader task: split the stream into lines here so the
        // state machine only ever sees whole frames.
        let out_tx = event_tx.clone();
        let id = identifier.to_string();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                if out_tx.send(TransportEvent::Stdout(line)).await.is_err() {
                    warn!(id = %id, "Transport event channel closed");
                    break;
                }
            }
        });

        // Stderr reader task: logged only, never parsed.
        let id = identifier.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(id = %id, "agent stderr: {line}");
            }
        });

        // Reaper task: waits for process exit, then drains the stdout
        // reader so `Exited` is always the final event.
        let id = identifier.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = stdout_task.await;
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(id = %id, error = %e, "Error waiting for agent process");
                    None
                }
            };
            let _ = event_tx.send(TransportEvent::Exited(code)).await;
        });

        Ok((Self { stdin_tx, pid }, event_rx))
    }

    /// Queue one protocol line (without trailing newline) for the agent's
    /// stdin.
    pub async fn write_line(&self, line: String) -> Result<(), TransportError> {
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// OS process id of the agent, if it was available at spawn time.
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send a POSIX signal to the agent process (not its child; the agent
    /// owns its child).
    #[cfg(unix)]
    pub fn signal(&self, signal: i32) -> Result<(), TransportError> {
        let pid = self.pid.ok_or(TransportError::SignalFailed {
            reason: "agent pid unknown".to_string(),
        })?;
        // SAFETY: pid was obtained from our own Child handle. kill(2) on an
        // owned subprocess is safe; a stale pid yields ESRCH, reported below.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, signal) };
        if ret == 0 {
            Ok(())
        } else {
            Err(TransportError::SignalFailed {
                reason: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _signal: i32) -> Result<(), TransportError> {
        Err(TransportError::SignalFailed {
            reason: "signals unsupported on this platform".to_string(),
        })
    }
}

/// Resolve a program name to an absolute executable path.
///
/// Names containing a path separator are checked as-is; bare names are
/// searched on `PATH`. Returns `None` when nothing executable is found;
/// callers treat that as a configuration error, not a retryable fault.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    let direct = Path::new(program);
    if direct.components().count() > 1 {
        return is_executable(direct).then(|| direct.to_path_buf());
    }

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn argv(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed early")
    }

    #[tokio::test]
    async fn connected_is_first_event() {
        let (_ep, mut rx) = AgentEndpoint::spawn(&argv("true"), "t").unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connected));
    }

    #[tokio::test]
    async fn stdout_is_framed_into_lines() {
        let (_ep, mut rx) =
            AgentEndpoint::spawn(&argv("printf 'alpha\\nbeta\\n'"), "t").unwrap();

        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connected));
        match next_event(&mut rx).await {
            TransportEvent::Stdout(line) => assert_eq!(line, "alpha"),
            other => panic!("expected stdout line, got {other:?}"),
        }
        match next_event(&mut rx).await {
            TransportEvent::Stdout(line) => assert_eq!(line, "beta"),
            other => panic!("expected stdout line, got {other:?}"),
        }
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Exited(Some(0))
        ));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let (_ep, mut rx) = AgentEndpoint::spawn(&argv("exit 3"), "t").unwrap();
        loop {
            if let TransportEvent::Exited(code) = next_event(&mut rx).await {
                assert_eq!(code, Some(3));
                break;
            }
        }
    }

    #[tokio::test]
    async fn written_lines_reach_agent_stdin() {
        let (ep, mut rx) = AgentEndpoint::spawn(&argv("read line; echo \"got:$line\""), "t").unwrap();
        ep.write_line("hello".to_string()).await.unwrap();

        loop {
            match next_event(&mut rx).await {
                TransportEvent::Stdout(line) => {
                    assert_eq!(line, "got:hello");
                    break;
                }
                TransportEvent::Exited(_) => panic!("agent exited before echoing"),
                TransportEvent::Connected => {}
            }
        }
    }

    #[tokio::test]
    async fn sigkill_terminates_agent() {
        let (ep, mut rx) = AgentEndpoint::spawn(&argv("sleep 30"), "t").unwrap();
        assert!(matches!(next_event(&mut rx).await, TransportEvent::Connected));

        ep.signal(libc::SIGKILL).unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Exited(None)
        ));
    }

    #[test]
    fn resolve_finds_sh() {
        let path = resolve_executable("sh").expect("sh should be on PATH");
        assert!(path.is_absolute());
    }

    #[test]
    fn resolve_rejects_missing_program() {
        assert!(resolve_executable("definitely-not-a-real-binary-42").is_none());
    }

    #[test]
    fn resolve_accepts_absolute_path() {
        assert_eq!(
            resolve_executable("/bin/sh"),
            Some(PathBuf::from("/bin/sh"))
        );
    }
}
