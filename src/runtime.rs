//! Execution backend contract and the state bridge.
//!
//! The daemon never runs container processes itself. It talks to an
//! [`ExecutionBackend`] through asynchronous calls and receives
//! [`BackendEvent`]s on a subscription stream. The runtime client turns
//! those events into [`StateInfo`] values and hands them to a
//! [`StateBridge`], which the daemon implements.
//!
//! ```text
//!   Daemon ──start──► Client ──create_container──► Backend
//!     ▲                 │                             │
//!     │ state_changed   │ handle_event ◄── subscribe ─┘
//!     └─────────────────┘
//! ```
//!
//! Events for one container arrive in emission order; across containers no
//! order is implied.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;

// =============================================================================
// Signals
// =============================================================================

/// Signal to send to a container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM (graceful shutdown).
    Term,
    /// SIGKILL (force kill).
    Kill,
    /// SIGHUP (hangup).
    Hup,
    /// SIGINT (interrupt).
    Int,
    /// SIGUSR1.
    Usr1,
    /// SIGUSR2.
    Usr2,
}

impl Signal {
    /// Returns the signal number.
    pub fn as_i32(&self) -> i32 {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
            Self::Hup => libc::SIGHUP,
            Self::Int => libc::SIGINT,
            Self::Usr1 => libc::SIGUSR1,
            Self::Usr2 => libc::SIGUSR2,
        }
    }

    /// Parses from signal name (e.g., "SIGTERM", "TERM", "15").
    pub fn from_str(s: &str) -> Option<Self> {
        let s = s.to_uppercase();
        let s = s.strip_prefix("SIG").unwrap_or(&s);
        match s {
            "TERM" | "15" => Some(Self::Term),
            "KILL" | "9" => Some(Self::Kill),
            "HUP" | "1" => Some(Self::Hup),
            "INT" | "2" => Some(Self::Int),
            "USR1" | "10" => Some(Self::Usr1),
            "USR2" | "12" => Some(Self::Usr2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Term => write!(f, "SIGTERM"),
            Self::Kill => write!(f, "SIGKILL"),
            Self::Hup => write!(f, "SIGHUP"),
            Self::Int => write!(f, "SIGINT"),
            Self::Usr1 => write!(f, "SIGUSR1"),
            Self::Usr2 => write!(f, "SIGUSR2"),
        }
    }
}

// =============================================================================
// Backend Events
// =============================================================================

/// Kind of event reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Exit,
    Pause,
    Resume,
    Oom,
    /// Anything else; logged and dropped by the client.
    Other(String),
}

impl EventKind {
    /// Parses the backend's event type name.
    pub fn parse(s: &str) -> Self {
        match s {
            "exit" => Self::Exit,
            "pause" => Self::Pause,
            "resume" => Self::Resume,
            "oom" => Self::Oom,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the backend's name for this event type.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Exit => "exit",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Oom => "oom",
            Self::Other(s) => s,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event from the backend's subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEvent {
    pub container_id: String,
    /// `init` for the container's main process.
    pub process_id: String,
    pub kind: EventKind,
    pub exit_status: u32,
}

// =============================================================================
// Requests
// =============================================================================

/// Create-and-start request for a container's init process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub id: String,
    pub bundle_path: PathBuf,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub no_pivot_root: bool,
}

/// Process definition for an auxiliary (exec) process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default)]
    pub terminal: bool,
}

/// Launch request for an auxiliary process inside a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddProcessRequest {
    pub container_id: String,
    pub process_id: String,
    pub process: ProcessSpec,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

// =============================================================================
// Execution Backend Trait
// =============================================================================

/// Asynchronous interface to the lower-level execution backend.
///
/// # Implementations
///
/// - `RemoteBackend`: newline-delimited JSON over a Unix socket
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Returns the backend name.
    fn name(&self) -> &str;

    /// Creates and starts a container from a bundle. Returns the system PID
    /// of its init process.
    async fn create_container(&self, request: CreateRequest) -> Result<u32>;

    /// Opens the event subscription.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>>;

    /// Sends a signal to one process of a container.
    async fn signal(&self, container_id: &str, process_id: &str, signal: Signal) -> Result<()>;

    /// Launches an auxiliary process. Returns its system PID.
    async fn add_process(&self, request: AddProcessRequest) -> Result<u32> {
        let _ = request;
        Err(crate::error::Error::NotSupported(format!(
            "add_process not supported by {} backend",
            self.name()
        )))
    }

    /// Freezes or thaws every process of a container.
    async fn set_paused(&self, container_id: &str, paused: bool) -> Result<()> {
        let _ = (container_id, paused);
        Err(crate::error::Error::NotSupported(format!(
            "pause not supported by {} backend",
            self.name()
        )))
    }
}

// =============================================================================
// State Bridge
// =============================================================================

/// Reconciled container state pushed to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    Start,
    Exit,
    Pause,
    Resume,
    Oom,
    ExitProcess,
    Restart,
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Exit => write!(f, "exit"),
            Self::Pause => write!(f, "pause"),
            Self::Resume => write!(f, "resume"),
            Self::Oom => write!(f, "oom"),
            Self::ExitProcess => write!(f, "exit-process"),
            Self::Restart => write!(f, "restart"),
        }
    }
}

/// One state transition as seen by the runtime client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateInfo {
    pub state: StateKind,
    pub exit_code: u32,
    pub oom_killed: bool,
    /// Set for `ExitProcess`.
    pub process_id: Option<String>,
    /// Set for `Start`.
    pub pid: Option<u32>,
}

impl StateInfo {
    /// Creates a state with no exit information.
    pub fn new(state: StateKind) -> Self {
        Self {
            state,
            exit_code: 0,
            oom_killed: false,
            process_id: None,
            pid: None,
        }
    }
}

/// Named pipe endpoints of one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoPipes {
    /// `init` for the container's main process.
    pub process_id: String,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub terminal: bool,
}

/// Callbacks the runtime client invokes on its owner.
///
/// `state_changed` is called exactly once per reconciled transition, in
/// arrival order per container, never while the client holds that
/// container's lock. `attach_streams` is called with the client lock held
/// and must not block on container state.
#[async_trait]
pub trait StateBridge: Send + Sync {
    /// Applies a reconciled state transition.
    async fn state_changed(&self, id: &str, info: StateInfo) -> Result<()>;

    /// Hands over the I/O pipes of a freshly started process.
    async fn attach_streams(&self, id: &str, pipes: IoPipes) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_parsing() {
        assert_eq!(Signal::from_str("SIGTERM"), Some(Signal::Term));
        assert_eq!(Signal::from_str("TERM"), Some(Signal::Term));
        assert_eq!(Signal::from_str("15"), Some(Signal::Term));
        assert_eq!(Signal::from_str("sigkill"), Some(Signal::Kill));
        assert_eq!(Signal::from_str("INVALID"), None);
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(EventKind::parse("exit"), EventKind::Exit);
        assert_eq!(EventKind::parse("oom"), EventKind::Oom);
        assert_eq!(
            EventKind::parse("exec-added"),
            EventKind::Other("exec-added".to_string())
        );
        assert_eq!(EventKind::parse("exec-added").as_str(), "exec-added");
    }
}
