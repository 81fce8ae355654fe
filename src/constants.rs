//! # Daemon Constants
//!
//! Limits, timeouts, on-disk layout names and environment override keys for
//! the container lifecycle daemon. These are the single source of truth for
//! bounds used throughout the codebase.
//!
//! ## Cross-References
//!
//! - [`crate::restart`]: Uses the backoff constants
//! - [`crate::client`]: Uses the bundle and pipe names
//! - [`crate::daemon`]: Uses exit codes, timeouts and resource floors
//! - [`crate::config`]: Uses the environment override keys

use std::time::Duration;

// =============================================================================
// Identifiers
// =============================================================================

/// Length of a full container ID in hex characters (SHA-256).
pub const CONTAINER_ID_LEN: usize = 64;

/// Length of the abbreviated ID used in logs and generated names.
pub const SHORT_ID_LEN: usize = 12;

/// Maximum container ID length accepted from the backend.
///
/// **Security**: IDs become directory names under the exec root. Bounding
/// the length keeps paths under `PATH_MAX` with room for pipe suffixes.
pub const MAX_CONTAINER_ID_LEN: usize = 128;

/// Maximum container name length.
pub const MAX_CONTAINER_NAME_LEN: usize = 253;

/// Characters allowed in container IDs.
pub const CONTAINER_ID_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Process ID the backend uses for a container's init process.
///
/// Exit events carrying any other process ID belong to auxiliary (exec)
/// processes and never trigger restart logic.
pub const INIT_PROCESS_ID: &str = "init";

// =============================================================================
// Restart Backoff
// =============================================================================
//
// Delays grow 100ms, 200ms, 400ms, ... up to RESTART_BACKOFF_MAX. A run that
// lasted at least RESTART_RESET_UPTIME resets the sequence.
// =============================================================================

/// First restart delay.
pub const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Multiplier applied to the delay on each consecutive restart.
pub const RESTART_BACKOFF_MULTIPLIER: u32 = 2;

/// Upper bound on a single restart delay.
///
/// **Rationale**: Without a cap a crash-looping container would eventually
/// wait hours between attempts.
pub const RESTART_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Uptime after which the backoff sequence starts over.
pub const RESTART_RESET_UPTIME: Duration = Duration::from_secs(10);

// =============================================================================
// Exit Codes
// =============================================================================

/// Exit code recorded when the container command does not exist.
pub const EXIT_CODE_COMMAND_NOT_FOUND: i32 = 127;

/// Exit code recorded when the container command cannot be executed.
pub const EXIT_CODE_NOT_INVOKABLE: i32 = 126;

/// Exit code recorded for any other start failure.
pub const EXIT_CODE_START_FAILED: i32 = 128;

// =============================================================================
// Timeouts
// =============================================================================

/// Grace period between SIGTERM and SIGKILL on stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the exit event after SIGKILL.
pub const KILL_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for a single remote backend request.
pub const BACKEND_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for connecting to the remote backend socket.
pub const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Resource Validation
// =============================================================================

/// Minimum memory limit accepted at create (4 MiB).
///
/// **Rationale**: Below this the container runtime itself cannot start the
/// init process.
pub const MIN_MEMORY_LIMIT: i64 = 4 * 1024 * 1024;

/// Minimum non-zero CPU shares.
pub const MIN_CPU_SHARES: i64 = 2;

/// Maximum CPU shares.
pub const MAX_CPU_SHARES: i64 = 262_144;

// =============================================================================
// On-Disk Layout
// =============================================================================

/// Directory under the daemon root holding per-container metadata.
pub const CONTAINERS_DIR: &str = "containers";

/// Persisted container record inside a container's metadata directory.
pub const CONTAINER_CONFIG_FILE: &str = "config.v2.json";

/// OCI runtime config inside a bundle directory.
pub const BUNDLE_CONFIG_FILE: &str = "config.json";

/// Suffixes for the named pipes created per process.
pub const STDIN_SUFFIX: &str = "stdin";
pub const STDOUT_SUFFIX: &str = "stdout";
pub const STDERR_SUFFIX: &str = "stderr";

/// Directory inside a container's metadata directory used for `/dev/shm`.
pub const SHM_DIR: &str = "shm";

/// Size of the tmpfs mounted for `/dev/shm` (64 MiB).
pub const DEFAULT_SHM_SIZE: u64 = 64 * 1024 * 1024;

/// Read buffer for pipe draining and log copying.
pub const PIPE_BUFFER_SIZE: usize = 32 * 1024;

// =============================================================================
// Defaults
// =============================================================================

/// Network mode used when a container does not request one.
pub const DEFAULT_NETWORK_MODE: &str = "bridge";

/// OCI Runtime Spec version written into bundles.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// PATH injected when the container environment has none.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Capacity of the lifecycle event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the backend event subscription channel.
pub const BACKEND_EVENT_CAPACITY: usize = 1024;

/// Maximum size of one line on the remote backend socket (1 MiB).
pub const MAX_REMOTE_MESSAGE_SIZE: usize = 1024 * 1024;

// =============================================================================
// Environment Overrides
// =============================================================================
//
// Read exactly once into `DaemonConfig` at startup. Nothing below the binary
// consults the process environment.
// =============================================================================

/// Set to `1` to keep bundle directories after exit (diagnostics).
pub const ENV_NO_CLEAN: &str = "BERTH_NOCLEAN";

/// Set to any non-empty value to start containers with `no_pivot_root`.
pub const ENV_RAMDISK: &str = "BERTH_RAMDISK";

/// Overrides the daemon root directory.
pub const ENV_ROOT: &str = "BERTH_ROOT";

/// Overrides the exec root directory.
pub const ENV_EXEC_ROOT: &str = "BERTH_EXEC_ROOT";

/// Overrides the execution backend socket path.
pub const ENV_BACKEND_SOCKET: &str = "BERTH_BACKEND_SOCKET";

/// Set to `1` or `true` to enable debug logging.
pub const ENV_DEBUG: &str = "BERTH_DEBUG";

// =============================================================================
// Validation
// =============================================================================

/// Validates a container ID received from a backend or a caller.
#[must_use = "validation result must be checked"]
pub fn validate_container_id(id: &str) -> std::result::Result<(), &'static str> {
    if id.is_empty() {
        return Err("container ID cannot be empty");
    }
    if id.len() > MAX_CONTAINER_ID_LEN {
        return Err("container ID exceeds maximum length");
    }
    if !id.chars().all(|c| CONTAINER_ID_VALID_CHARS.contains(c)) {
        return Err("container ID contains invalid characters");
    }
    if id == "." || id == ".." {
        return Err("container ID cannot be a relative path component");
    }
    Ok(())
}

/// Validates a container name: `[a-zA-Z0-9][a-zA-Z0-9_.-]+`.
///
/// A single leading `/` is accepted and ignored.
#[must_use = "validation result must be checked"]
pub fn validate_container_name(name: &str) -> std::result::Result<(), &'static str> {
    let name = name.strip_prefix('/').unwrap_or(name);
    if name.len() < 2 {
        return Err("container name must be at least two characters");
    }
    if name.len() > MAX_CONTAINER_NAME_LEN {
        return Err("container name exceeds maximum length");
    }
    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err("container name must start with a letter or digit");
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err("container name contains invalid characters");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        assert!(RESTART_BACKOFF_BASE < RESTART_BACKOFF_MAX);
        assert!(RESTART_BACKOFF_MULTIPLIER >= 2);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_container_name("web").is_ok());
        assert!(validate_container_name("/web-1.a_b").is_ok());
        assert!(validate_container_name("w").is_err());
        assert!(validate_container_name("-web").is_err());
        assert!(validate_container_name("we b").is_err());
    }
}
