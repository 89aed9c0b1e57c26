//! Line-oriented wire protocol between the engine and its agents.
//!
//! Every frame is one newline-terminated UTF-8 line of the form
//! `keyword payload`. The engine writes [`ControlMessage`] frames to the
//! agent's stdin and reads [`AgentMessage`] frames from its stdout.
//!
//! Decoding agent output is total: lines that echo control keywords back
//! (an artifact of some transports feeding stdin into stdout) decode to
//! [`AgentMessage::Loopback`], and anything unrecognized or malformed
//! decodes to [`AgentMessage::Unknown`]. A bad line must never take the
//! engine down.

use crate::error::{Error, Result};
use crate::state::ProcessState;

/// Frame sent by the engine to an agent's stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Command line the agent's child must execute.
    Do(String),
    /// Space-joined `KEY=VALUE` environment pairs for the child.
    Env(String),
    /// Directory for the child's log file.
    LogDir(String),
    /// Launch the child now.
    Run,
    /// Terminate the child.
    Stop,
    /// Liveness probe.
    Ping,
}

impl ControlMessage {
    /// Wire keyword of this frame.
    pub const fn keyword(&self) -> &'static str {
        match self {
            Self::Do(_) => "do",
            Self::Env(_) => "env",
            Self::LogDir(_) => "logdir",
            Self::Run => "run",
            Self::Stop => "stop",
            Self::Ping => "ping",
        }
    }

    /// Encode as a wire line, without the trailing newline.
    ///
    /// Payload-less frames keep the separating space (`"run "`), matching
    /// the `keyword payload` framing on every line.
    pub fn encode(&self) -> String {
        let payload = match self {
            Self::Do(cmd) => cmd.as_str(),
            Self::Env(pairs) => pairs.as_str(),
            Self::LogDir(dir) => dir.as_str(),
            Self::Run | Self::Stop | Self::Ping => "",
        };
        format!("{} {}", self.keyword(), payload)
    }

    /// Decode a control line read by the agent.
    pub fn decode(line: &str) -> Result<Self> {
        let line = line.trim_end();
        let (keyword, payload) = split_frame(line);
        match keyword {
            "do" => Ok(Self::Do(payload.to_string())),
            "env" => Ok(Self::Env(payload.to_string())),
            "logdir" => Ok(Self::LogDir(payload.to_string())),
            "run" => Ok(Self::Run),
            "stop" => Ok(Self::Stop),
            "ping" => Ok(Self::Ping),
            other => Err(Error::UnknownKeyword(other.to_string())),
        }
    }
}

/// Frame read by the engine from an agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    /// Agent finished its own setup and accepts startup commands.
    Ready,
    /// Generic acknowledgement.
    Ok,
    /// The child executable could not be found.
    NotFound,
    /// OS process id of the child.
    ChildPid(u32),
    /// Child state transition. `running_secs` is present only when the
    /// child stopped, and carries how long it ran.
    State {
        state: ProcessState,
        running_secs: Option<f64>,
    },
    /// Diagnostic passthrough.
    Msg(String),
    /// Diagnostic passthrough, logged by the engine.
    Log(String),
    /// Diagnostic passthrough, logged as an error.
    Error(String),
    /// Child exit code.
    Retval(i32),
    /// Reply to `ping`.
    Pong,
    /// The agent is exiting.
    Bye,
    /// Echo of a control keyword the engine itself sent; ignored.
    Loopback { keyword: String },
    /// Unrecognized keyword or malformed payload; logged and dropped.
    Unknown { keyword: String, rest: String },
}

impl AgentMessage {
    /// Decode one line of agent stdout. Never fails.
    pub fn decode(line: &str) -> Self {
        let line = line.trim_end();
        let (keyword, payload) = split_frame(line);
        match keyword {
            "ready" => Self::Ready,
            "ok" => Self::Ok,
            "not_found" => Self::NotFound,
            "child_pid" => payload
                .split_whitespace()
                .next()
                .and_then(|w| w.parse().ok())
                .map_or_else(|| Self::unknown(keyword, payload), Self::ChildPid),
            "state" => decode_state(payload).unwrap_or_else(|| Self::unknown(keyword, payload)),
            "msg" => Self::Msg(payload.to_string()),
            "log" => Self::Log(payload.to_string()),
            "error" => Self::Error(payload.to_string()),
            "retval" => payload
                .split_whitespace()
                .next()
                .and_then(|w| w.parse().ok())
                .map_or_else(|| Self::unknown(keyword, payload), Self::Retval),
            "pong" => Self::Pong,
            "bye" => Self::Bye,
            // What we write to the agent's stdin sometimes comes back on
            // its stdout (PTY transports echo). Screen those out here.
            "do" | "env" | "run" | "logdir" | "stop" => Self::Loopback {
                keyword: keyword.to_string(),
            },
            other => Self::unknown(other, payload),
        }
    }

    /// Encode as a wire line, without the trailing newline.
    pub fn encode(&self) -> String {
        match self {
            Self::Ready => "ready ".to_string(),
            Self::Ok => "ok ".to_string(),
            Self::NotFound => "not_found ".to_string(),
            Self::ChildPid(pid) => format!("child_pid {pid}"),
            Self::State {
                state,
                running_secs: Some(secs),
            } => format!("state {state} {secs}"),
            Self::State {
                state,
                running_secs: None,
            } => format!("state {state}"),
            Self::Msg(text) => format!("msg {text}"),
            Self::Log(text) => format!("log {text}"),
            Self::Error(text) => format!("error {text}"),
            Self::Retval(code) => format!("retval {code}"),
            Self::Pong => "pong ".to_string(),
            Self::Bye => "bye ".to_string(),
            Self::Loopback { keyword } => format!("{keyword} "),
            Self::Unknown { keyword, rest } => format!("{keyword} {rest}"),
        }
    }

    fn unknown(keyword: &str, rest: &str) -> Self {
        Self::Unknown {
            keyword: keyword.to_string(),
            rest: rest.to_string(),
        }
    }
}

/// Split a line into its keyword and the remainder after the first space.
fn split_frame(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((keyword, payload)) => (keyword, payload),
        None => (line, ""),
    }
}

fn decode_state(payload: &str) -> Option<AgentMessage> {
    let mut words = payload.split_whitespace();
    let state: ProcessState = words.next()?.parse().ok()?;
    let running_secs = words.next().and_then(|w| w.parse().ok());
    Some(AgentMessage::State {
        state,
        running_secs,
    })
}
