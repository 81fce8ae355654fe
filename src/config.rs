//! Daemon configuration.
//!
//! [`DaemonConfig`] is built once at startup and shared by `Arc`. Sources
//! are applied in order: built-in defaults, an optional YAML file, then
//! environment overrides. The environment is read through a lookup closure
//! so the rest of the crate never touches process-global state.

use crate::constants::{
    CONTAINERS_DIR, DEFAULT_NETWORK_MODE, DEFAULT_STOP_TIMEOUT, ENV_BACKEND_SOCKET, ENV_DEBUG,
    ENV_EXEC_ROOT, ENV_NO_CLEAN, ENV_RAMDISK, ENV_ROOT,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns the platform-appropriate daemon root.
///
/// - Linux: `/var/lib/berth`
/// - macOS: `~/.berth/lib`
/// - Other: `berth/lib` under the local data directory
fn default_root() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/berth")
    }

    #[cfg(target_os = "macos")]
    {
        dirs::home_dir()
            .map(|h| h.join(".berth").join("lib"))
            .unwrap_or_else(|| PathBuf::from(".berth/lib"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        dirs::data_local_dir()
            .map(|d| d.join("berth").join("lib"))
            .unwrap_or_else(|| PathBuf::from("berth/lib"))
    }
}

/// Returns the platform-appropriate exec root (bundles and pipes).
fn default_exec_root() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/run/berth")
    }

    #[cfg(not(target_os = "linux"))]
    {
        dirs::runtime_dir()
            .map(|d| d.join("berth"))
            .unwrap_or_else(|| default_root().join("run"))
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Persistent state: container metadata, layers, volumes.
    pub root: PathBuf,
    /// Ephemeral state: OCI bundles and named pipes.
    pub exec_root: PathBuf,
    /// Unix socket of the execution backend.
    pub backend_socket: PathBuf,
    /// Network mode applied when a container requests none.
    pub default_network_mode: String,
    /// Owner of container metadata directories.
    pub root_uid: u32,
    pub root_gid: u32,
    /// Ask the backend not to pivot_root (rootfs on ramdisk).
    pub no_pivot_root: bool,
    /// Keep bundle directories after exit.
    pub no_clean: bool,
    /// Enable debug logging.
    pub debug: bool,
    /// Per-container stop grace period used at shutdown, in seconds.
    pub shutdown_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let exec_root = default_exec_root();
        Self {
            root: default_root(),
            backend_socket: exec_root.join("backend.sock"),
            exec_root,
            default_network_mode: DEFAULT_NETWORK_MODE.to_string(),
            root_uid: 0,
            root_gid: 0,
            no_pivot_root: false,
            no_clean: false,
            debug: false,
            shutdown_timeout_secs: DEFAULT_STOP_TIMEOUT.as_secs(),
        }
    }
}

impl DaemonConfig {
    /// Creates a config rooted at `root`, with the exec root beneath it.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let exec_root = root.join("run");
        Self {
            backend_socket: exec_root.join("backend.sock"),
            exec_root,
            root,
            ..Self::default()
        }
    }

    /// Loads the config from an optional YAML file, then applies the
    /// process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_yaml_file(p)?,
            None => Self::default(),
        };
        let config = config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parses a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses YAML text. Missing keys keep their defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Applies environment overrides through `lookup`.
    #[must_use]
    pub fn apply_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            self.root = PathBuf::from(root);
        }
        if let Some(exec_root) = lookup(ENV_EXEC_ROOT).filter(|v| !v.is_empty()) {
            self.exec_root = PathBuf::from(exec_root);
        }
        if let Some(socket) = lookup(ENV_BACKEND_SOCKET).filter(|v| !v.is_empty()) {
            self.backend_socket = PathBuf::from(socket);
        }
        if lookup(ENV_NO_CLEAN).as_deref() == Some("1") {
            self.no_clean = true;
        }
        if lookup(ENV_RAMDISK).is_some_and(|v| !v.is_empty()) {
            self.no_pivot_root = true;
        }
        if matches!(lookup(ENV_DEBUG).as_deref(), Some("1" | "true")) {
            self.debug = true;
        }
        self
    }

    /// Checks the config for values the daemon cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "root must be an absolute path: {}",
                self.root.display()
            )));
        }
        if !self.exec_root.is_absolute() {
            return Err(Error::InvalidConfig(format!(
                "exec_root must be an absolute path: {}",
                self.exec_root.display()
            )));
        }
        if self.default_network_mode.is_empty() {
            return Err(Error::InvalidConfig(
                "default_network_mode cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding per-container metadata directories.
    pub fn containers_dir(&self) -> PathBuf {
        self.root.join(CONTAINERS_DIR)
    }

    /// Stop grace period applied at shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let config = DaemonConfig::with_root("/srv/berth").apply_env(env(&[
            ("BERTH_NOCLEAN", "1"),
            ("BERTH_RAMDISK", "yes"),
            ("BERTH_EXEC_ROOT", "/tmp/run"),
        ]));
        assert!(config.no_clean);
        assert!(config.no_pivot_root);
        assert_eq!(config.exec_root, PathBuf::from("/tmp/run"));
        assert_eq!(config.root, PathBuf::from("/srv/berth"));
    }

    #[test]
    fn test_env_noclean_requires_one() {
        let config = DaemonConfig::with_root("/srv/berth")
            .apply_env(env(&[("BERTH_NOCLEAN", "true"), ("BERTH_RAMDISK", "")]));
        assert!(!config.no_clean);
        assert!(!config.no_pivot_root);
    }
}
