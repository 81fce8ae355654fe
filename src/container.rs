//! Daemon-side container record.
//!
//! A [`Container`] is owned by the daemon's store and mutated only while its
//! per-container lock is held. The durable part is written to
//! `<root>/config.v2.json` after every confirmed transition.

use crate::constants::{CONTAINER_CONFIG_FILE, EXIT_CODE_START_FAILED};
use crate::error::{Error, Result};
use crate::restart::{RestartManager, RestartPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Configuration
// =============================================================================

/// Portable container configuration (what to run).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Image reference.
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    /// `KEY=value` entries.
    pub env: Vec<String>,
    pub working_dir: String,
    /// `uid[:gid]`.
    pub user: String,
    pub hostname: String,
    pub tty: bool,
    pub open_stdin: bool,
    /// Anonymous volume destinations.
    pub volumes: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
}

/// Host-dependent configuration (how to run it).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// `source:destination[:ro]`. A source without `/` names a volume.
    pub binds: Vec<String>,
    /// `name[:alias]`.
    pub links: Vec<String>,
    /// `bridge`, `host`, `none`, `container:<name>` or a network name.
    pub network_mode: String,
    pub restart_policy: RestartPolicy,
    pub security_opt: Vec<String>,
    /// `""`, `private`, `shareable` or `host`.
    pub ipc_mode: String,
    /// `""` or `host`.
    pub pid_mode: String,
    /// Memory limit in bytes (0 = unlimited).
    pub memory: i64,
    pub cpu_shares: i64,
    /// 0 = unlimited.
    pub pids_limit: i64,
    pub readonly_rootfs: bool,
}

/// Requested network endpoints at create time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkingConfig {
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

/// Per-network endpoint request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub aliases: Vec<String>,
    pub ip_address: Option<String>,
}

/// Network attachment state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// Network namespace path once attached.
    pub sandbox_key: Option<String>,
    pub networks: BTreeMap<String, EndpointSettings>,
}

/// One attached (or placeholder) endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    pub endpoint_id: String,
    pub ip_address: String,
    pub gateway: String,
    pub mac_address: String,
    pub aliases: Vec<String>,
}

impl NetworkSettings {
    /// Placeholder settings: one empty endpoint per requested network.
    pub fn placeholder(network_mode: &str, requested: &NetworkingConfig) -> Self {
        let mut networks = BTreeMap::new();
        for (name, endpoint) in &requested.endpoints {
            networks.insert(
                name.clone(),
                EndpointSettings {
                    aliases: endpoint.aliases.clone(),
                    ..EndpointSettings::default()
                },
            );
        }
        if networks.is_empty() && is_attachable_mode(network_mode) {
            networks.insert(network_mode.to_string(), EndpointSettings::default());
        }
        Self {
            sandbox_key: None,
            networks,
        }
    }

    /// Returns true if any endpoint has been attached.
    pub fn is_attached(&self) -> bool {
        self.sandbox_key.is_some()
            || self.networks.values().any(|e| !e.endpoint_id.is_empty())
    }
}

/// Returns the peer name for `container:<name>` network or IPC modes.
pub fn connected_container(mode: &str) -> Option<&str> {
    mode.strip_prefix("container:").filter(|s| !s.is_empty())
}

/// Returns true for modes that need a network controller attachment.
pub fn is_attachable_mode(mode: &str) -> bool {
    !mode.is_empty() && mode != "host" && mode != "none" && connected_container(mode).is_none()
}

// =============================================================================
// Mounts and Links
// =============================================================================

/// A mount requested at create time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPoint {
    pub source: PathBuf,
    pub destination: String,
    pub read_write: bool,
    /// Volume name for volume-backed mounts, `None` for host binds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<String>,
    /// Volume was created for this container alone.
    #[serde(default)]
    pub anonymous: bool,
}

/// A link to another container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub container_id: String,
    pub alias: String,
}

// =============================================================================
// State
// =============================================================================

/// Execution state of a container.
///
/// Running, paused and restarting are distinct variants, so at most one of
/// them holds at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl RunState {
    /// Returns true while a process exists or is about to.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Restarting)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Runtime state of a container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    pub status: RunState,
    pub removal_in_progress: bool,
    pub pid: u32,
    pub exit_code: i32,
    pub error: String,
    pub oom_killed: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl State {
    /// Running or paused: a process exists.
    pub fn is_running(&self) -> bool {
        matches!(self.status, RunState::Running | RunState::Paused)
    }

    pub fn is_paused(&self) -> bool {
        self.status == RunState::Paused
    }

    pub fn is_restarting(&self) -> bool {
        self.status == RunState::Restarting
    }

    pub fn is_dead(&self) -> bool {
        self.status == RunState::Dead
    }

    /// Records a successful start.
    pub fn set_running(&mut self, pid: u32, at: DateTime<Utc>) {
        self.status = RunState::Running;
        self.pid = pid;
        self.exit_code = 0;
        self.error.clear();
        self.oom_killed = false;
        self.started_at = Some(at);
    }

    /// Records a terminal exit.
    pub fn set_stopped(&mut self, exit_code: i32, oom_killed: bool) {
        self.status = RunState::Exited;
        self.pid = 0;
        self.exit_code = exit_code;
        self.oom_killed = oom_killed;
        self.finished_at = Some(Utc::now());
    }

    /// Records an exit that will be followed by an automatic restart.
    pub fn set_restarting(&mut self, exit_code: i32, oom_killed: bool) {
        self.status = RunState::Restarting;
        self.pid = 0;
        self.exit_code = exit_code;
        self.oom_killed = oom_killed;
        self.finished_at = Some(Utc::now());
    }

    /// Records a failed start. The exit code defaults to 128.
    pub fn set_start_error(&mut self, error: String, exit_code: Option<i32>) {
        self.error = error;
        if let Some(code) = exit_code {
            self.exit_code = code;
        }
        if self.exit_code == 0 {
            self.exit_code = EXIT_CODE_START_FAILED;
        }
        self.pid = 0;
        if self.status.is_alive() {
            self.status = RunState::Exited;
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        if paused && self.status == RunState::Running {
            self.status = RunState::Paused;
        } else if !paused && self.status == RunState::Paused {
            self.status = RunState::Running;
        }
    }

    pub fn set_dead(&mut self) {
        self.status = RunState::Dead;
        self.pid = 0;
    }

    /// Clears flags that cannot survive a daemon restart.
    pub fn reset_after_restore(&mut self) {
        if self.status.is_alive() {
            self.status = RunState::Exited;
            self.finished_at = Some(Utc::now());
        }
        self.pid = 0;
        self.removal_in_progress = false;
    }
}

// =============================================================================
// Exec
// =============================================================================

/// An auxiliary process registered on a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    pub id: String,
    pub container_id: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub user: String,
    pub working_dir: String,
    pub tty: bool,
    pub running: bool,
    pub pid: u32,
    pub exit_code: Option<i32>,
}

// =============================================================================
// Container
// =============================================================================

/// The daemon's record of one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub created: DateTime<Utc>,
    /// Resolved command binary.
    pub path: String,
    pub args: Vec<String>,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub image_id: String,
    pub state: State,
    /// Metadata directory.
    pub root: PathBuf,
    /// Writable layer handle.
    #[serde(default)]
    pub rw_layer: Option<String>,
    /// Mounted root filesystem; set only while mounted.
    #[serde(skip)]
    pub base_fs: Option<PathBuf>,
    #[serde(default)]
    pub mount_label: String,
    #[serde(default)]
    pub process_label: String,
    /// Keyed by destination.
    #[serde(default)]
    pub mount_points: BTreeMap<String, MountPoint>,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub network_settings: NetworkSettings,
    /// Path of the `/dev/shm` mount source, set by IPC setup.
    #[serde(default)]
    pub shm_path: Option<PathBuf>,
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub has_been_manually_stopped: bool,
    /// Registered exec instances.
    #[serde(skip)]
    pub exec_commands: BTreeSet<String>,
    #[serde(skip)]
    restart_manager: Option<Arc<RestartManager>>,
}

impl Container {
    /// Creates a record in the `created` state.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        root: PathBuf,
        config: ContainerConfig,
        host_config: HostConfig,
        image_id: impl Into<String>,
    ) -> Self {
        let (path, args) = split_command(&config);
        Self {
            id: id.into(),
            name: name.into(),
            created: Utc::now(),
            path,
            args,
            config,
            host_config,
            image_id: image_id.into(),
            state: State::default(),
            root,
            rw_layer: None,
            base_fs: None,
            mount_label: String::new(),
            process_label: String::new(),
            mount_points: BTreeMap::new(),
            links: Vec::new(),
            network_settings: NetworkSettings::default(),
            shm_path: None,
            restart_count: 0,
            has_been_manually_stopped: false,
            exec_commands: BTreeSet::new(),
            restart_manager: None,
        }
    }

    /// Path of the persisted record.
    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONTAINER_CONFIG_FILE)
    }

    /// Persists the record atomically (write to temp file, then rename).
    pub fn to_disk(&self) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        let path = self.config_path();
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Loads a record from its metadata directory.
    pub fn from_disk(root: &Path) -> Result<Self> {
        let content = fs::read(root.join(CONTAINER_CONFIG_FILE))?;
        let mut container: Self = serde_json::from_slice(&content)
            .map_err(|e| Error::Serialization(format!("{}: {}", root.display(), e)))?;
        container.root = root.to_path_buf();
        Ok(container)
    }

    /// Returns the restart manager, creating it on first use.
    ///
    /// With `reset` the restart count is zeroed and a fresh manager is built,
    /// which is what an explicit start wants.
    pub fn restart_manager(&mut self, reset: bool) -> Arc<RestartManager> {
        if reset {
            self.restart_count = 0;
            self.restart_manager = None;
        }
        let policy = self.host_config.restart_policy.clone();
        let count = self.restart_count;
        Arc::clone(
            self.restart_manager
                .get_or_insert_with(|| Arc::new(RestartManager::new(policy, count))),
        )
    }

    /// Returns the restart manager if one exists.
    pub fn current_restart_manager(&self) -> Option<&Arc<RestartManager>> {
        self.restart_manager.as_ref()
    }

    /// Command line as shown in start errors.
    pub fn command_display(&self) -> String {
        std::iter::once(self.path.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Abbreviated ID.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(crate::constants::SHORT_ID_LEN) {
            Some((end, _)) => &self.id[..end],
            None => &self.id,
        }
    }

    /// Env map used when merging image defaults.
    pub fn env_map(&self) -> HashMap<&str, &str> {
        self.config
            .env
            .iter()
            .filter_map(|e| e.split_once('='))
            .collect()
    }
}

/// Splits entrypoint + cmd into binary path and arguments.
fn split_command(config: &ContainerConfig) -> (String, Vec<String>) {
    let mut full = config.entrypoint.iter().chain(config.cmd.iter()).cloned();
    let path = full.next().unwrap_or_default();
    (path, full.collect())
}
