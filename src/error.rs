//! Error types for the container lifecycle daemon.
//!
//! Variants are grouped the way callers react to them:
//!
//! | Group | Raised by | Caller reaction |
//! |-------|-----------|-----------------|
//! | Validation | `create`, name lookup | nothing was mutated, report to the requester |
//! | Precondition | `start`, `stop`, `remove` | container is in the wrong state |
//! | Backend | the execution backend RPC | classified into exit codes 127/126/128 |
//! | Collaborator | storage, volumes, network, labels | triggers rollback during create |
//!
//! "Already in the desired state" is not an error; `start` and `stop` return
//! an outcome enum for that case instead.

use crate::constants::{EXIT_CODE_COMMAND_NOT_FOUND, EXIT_CODE_NOT_INVOKABLE};
use crate::restart::RestartError;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Container configuration rejected.
    #[error("invalid container config: {0}")]
    InvalidConfig(String),

    /// Image reference did not resolve.
    #[error("no such image: {0}")]
    ImageNotFound(String),

    /// Container name rejected.
    #[error("invalid container name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Container name already registered.
    #[error("the container name '{name}' is already in use by container '{id}'")]
    NameConflict { name: String, id: String },

    /// Container ID already registered.
    #[error("container ID '{0}' already exists")]
    IdConflict(String),

    /// No container matches the given name or ID.
    #[error("no such container: {0}")]
    ContainerNotFound(String),

    /// ID prefix matches more than one container.
    #[error("multiple containers match ID prefix '{0}'")]
    AmbiguousId(String),

    /// No exec instance with the given ID.
    #[error("no such exec instance: {0}")]
    ExecNotFound(String),

    // =========================================================================
    // Precondition Errors
    // =========================================================================
    /// Start requested on a paused container.
    #[error("cannot start a paused container, try unpause instead")]
    StartPaused(String),

    /// Container is being removed.
    #[error("container '{0}' is marked for removal and cannot be started")]
    RemovalInProgress(String),

    /// Container is dead.
    #[error("container '{0}' is marked as dead and cannot be started")]
    ContainerDead(String),

    /// Removal of a live container without force.
    #[error(
        "cannot remove running container '{0}', stop the container before attempting removal or use force"
    )]
    ContainerRunning(String),

    /// Container is in wrong state for operation.
    #[error("container '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// Auxiliary process ID already in use for this container.
    #[error("process '{process}' already exists in container '{container}'")]
    ProcessExists { container: String, process: String },

    // =========================================================================
    // Execution Backend Errors
    // =========================================================================
    /// Container command is missing from the root filesystem.
    #[error("container command '{command}' not found or does not exist")]
    CommandNotFound { command: String },

    /// Container command exists but cannot be executed.
    #[error("container command '{command}' could not be invoked")]
    CommandNotInvokable { command: String },

    /// Backend reported an error. The message is kept verbatim.
    #[error("{0}")]
    Backend(String),

    /// Operation not supported by this backend.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Writable layer or image store failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Volume store failure.
    #[error("volume error: {0}")]
    Volume(String),

    /// Network controller failure.
    #[error("network error: {0}")]
    Network(String),

    /// Security label failure.
    #[error("security label error: {0}")]
    Security(String),

    /// Restart manager refused the request.
    #[error(transparent)]
    Restart(#[from] RestartError),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: std::time::Duration,
    },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Backend error fragments meaning the command binary is absent.
const NOT_FOUND_MARKERS: &[&str] = &[
    "executable file not found",
    "no such file or directory",
    "system cannot find the file specified",
];

/// Backend error fragment meaning the command binary is not executable.
const PERMISSION_DENIED_MARKER: &str = "permission denied";

impl Error {
    /// Maps a failed start RPC onto the command-level error it describes.
    ///
    /// Only [`Error::Backend`] messages are inspected; everything else is
    /// returned unchanged so collaborator errors keep their identity.
    pub fn classify_start(self, command: &str) -> Self {
        let Self::Backend(message) = &self else {
            return self;
        };
        let lower = message.to_lowercase();
        if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
            Self::CommandNotFound {
                command: command.to_string(),
            }
        } else if lower.contains(PERMISSION_DENIED_MARKER) {
            Self::CommandNotInvokable {
                command: command.to_string(),
            }
        } else {
            self
        }
    }

    /// Exit code implied by the error, if it carries one.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandNotFound { .. } => Some(EXIT_CODE_COMMAND_NOT_FOUND),
            Self::CommandNotInvokable { .. } => Some(EXIT_CODE_NOT_INVOKABLE),
            _ => None,
        }
    }

    /// Returns true for lookup misses.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ContainerNotFound(_) | Self::ImageNotFound(_) | Self::ExecNotFound(_)
        )
    }
}
