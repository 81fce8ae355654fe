//! Lifecycle orchestrator.
//!
//! The [`Daemon`] owns the container registry and sequences every
//! lifecycle operation: it provisions storage, labels, volumes and networking
//! around the runtime client's start, rolls back on failure, and applies the
//! transitions the client reports through [`StateBridge`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Daemon                                                           │
//! │                                                                   │
//! │  create ──► ImageStore ─► LayerStore ─► VolumeStore ─► to_disk    │
//! │  start  ──► LayerStore.mount ─► Network ─► IPC ─► spec ─┐         │
//! │                                                         ▼         │
//! │  ContainerStore ◄── state_changed ◄──────────────── Client ──► RPC│
//! │        │                                                          │
//! │        └──► EventLog (create/start/die/...)                       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Locking
//!
//! Each container has one async lock ([`ContainerHandle::lock`]). Lifecycle
//! operations hold it for their whole sequence; the runtime client holds its
//! own per-container lock while reconciling events and delivers the result
//! afterwards, so the two never wait on each other.

pub mod collaborators;
mod create;
mod delete;
pub mod events;
mod exec;
mod monitor;
mod start;
mod stop;
pub mod store;
mod streams;

pub use collaborators::{
    AttachRequest, Collaborators, Image, ImageConfig, ImageStore, InitLayerFn, Labels, LayerStore,
    NetworkController, SecurityLabeler, Volume, VolumeStore,
};
pub use create::{CreateParams, CreateResponse};
pub use delete::RemoveOptions;
pub use events::{EventLog, LifecycleEvent};
pub use exec::ExecOptions;
pub use start::StartOutcome;
pub use stop::StopOutcome;
pub use store::{ContainerHandle, ContainerStore, StatusSnapshot};

use crate::bundle::create_private_dir;
use crate::client::{Client, ClientOptions};
use crate::config::DaemonConfig;
use crate::constants::{EVENT_CHANNEL_CAPACITY, validate_container_id};
use crate::container::{Container, ExecConfig};
use crate::error::Result;
use crate::platform::PlatformOps;
use crate::runtime::{ExecutionBackend, StateBridge};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The container lifecycle daemon.
pub struct Daemon {
    config: Arc<DaemonConfig>,
    store: ContainerStore,
    collaborators: Collaborators,
    platform: Arc<dyn PlatformOps>,
    client: Arc<Client>,
    events: EventLog,
    /// Exec instances by exec ID.
    execs: Mutex<HashMap<String, ExecConfig>>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("root", &self.config.root)
            .field("containers", &self.store.len())
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Daemon {
    /// Creates the daemon and its runtime client.
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the state directories
    /// cannot be created.
    pub fn new(
        config: Arc<DaemonConfig>,
        backend: Arc<dyn ExecutionBackend>,
        collaborators: Collaborators,
        platform: Arc<dyn PlatformOps>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        create_private_dir(&config.containers_dir())?;
        create_private_dir(&config.exec_root)?;

        let options = ClientOptions::from_config(&config);
        let daemon = Arc::new_cyclic(|weak: &Weak<Daemon>| {
            let bridge: Weak<dyn StateBridge> = weak.clone();
            Self {
                client: Arc::new(Client::new(backend, bridge, options)),
                config,
                store: ContainerStore::new(),
                collaborators,
                platform,
                events: EventLog::new(EVENT_CHANNEL_CAPACITY),
                execs: Mutex::new(HashMap::new()),
            }
        });
        info!(root = %daemon.config.root.display(), "daemon initialized");
        Ok(daemon)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn store(&self) -> &ContainerStore {
        &self.store
    }

    /// Starts ingesting backend events on a background task.
    pub fn spawn_event_loop(&self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(Arc::clone(&self.client).run_event_loop(shutdown))
    }

    /// Subscribes to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns a snapshot of one container.
    pub async fn inspect(&self, name: &str) -> Result<Container> {
        let handle = self.store.get(name)?;
        let container = handle.lock().await;
        Ok(container.clone())
    }

    /// Returns snapshots of all containers.
    pub async fn list(&self) -> Vec<Container> {
        let mut containers = Vec::new();
        for handle in self.store.list() {
            containers.push(handle.lock().await.clone());
        }
        containers
    }

    // =========================================================================
    // Restore and Shutdown
    // =========================================================================

    /// Loads persisted containers and starts those whose restart policy
    /// asks for it.
    ///
    /// Records that fail to load are skipped with a warning.
    pub async fn restore(self: &Arc<Self>) -> Result<()> {
        let dir = self.config.containers_dir();
        let mut autostart = Vec::new();

        for entry in std::fs::read_dir(&dir)? {
            let root = entry?.path();
            if !root.is_dir() {
                continue;
            }
            let mut container = match Container::from_disk(&root) {
                Ok(container) => container,
                Err(e) => {
                    warn!(path = %root.display(), error = %e, "failed to load container");
                    continue;
                }
            };
            if let Err(reason) = validate_container_id(&container.id) {
                warn!(path = %root.display(), reason, "skipping container with invalid ID");
                continue;
            }
            container.state.reset_after_restore();
            persist(&container);
            self.reference_volumes(&container).await;

            let wants_start = container
                .host_config
                .restart_policy
                .restarts_on_boot(container.has_been_manually_stopped);
            match self.store.add(container) {
                Ok(handle) => {
                    debug!(container = %handle.id(), name = %handle.name(), "restored container");
                    if wants_start {
                        autostart.push(handle.id().to_string());
                    }
                }
                Err(e) => warn!(path = %root.display(), error = %e, "failed to register container"),
            }
        }

        info!(
            containers = self.store.len(),
            autostart = autostart.len(),
            "restored containers"
        );
        for id in autostart {
            if let Err(e) = self.start(&id).await {
                warn!(container = %id, error = %e, "failed to restart container on boot");
            }
        }
        Ok(())
    }

    /// Takes the volume references a restored container held before the
    /// daemon went away.
    async fn reference_volumes(&self, container: &Container) {
        for mount in container.mount_points.values() {
            let Some(volume) = &mount.volume else {
                continue;
            };
            if let Err(e) = self
                .collaborators
                .volumes
                .create_with_ref(Some(volume), create::DEFAULT_VOLUME_DRIVER, &container.id)
                .await
            {
                warn!(container = %container.id, %volume, error = %e, "failed to reference volume");
            }
        }
    }

    /// Stops every alive container without marking it manually stopped, so
    /// restart policies apply again on the next boot.
    pub async fn shutdown(self: &Arc<Self>) {
        let timeout = self.config.shutdown_timeout();
        let mut tasks = JoinSet::new();
        for handle in self.store.list() {
            if !handle.status().status.is_alive() {
                continue;
            }
            let daemon = Arc::clone(self);
            tasks.spawn(async move {
                if let Err(e) = daemon.stop_container(&handle, Some(timeout), false).await {
                    warn!(container = %handle.id(), error = %e, "failed to stop container");
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        info!("daemon shut down");
    }

    fn execs(&self) -> MutexGuard<'_, HashMap<String, ExecConfig>> {
        self.execs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Writes the record to disk, logging instead of failing.
fn persist(container: &Container) {
    if let Err(e) = container.to_disk() {
        warn!(container = %container.id, error = %e, "failed to persist container state");
    }
}
