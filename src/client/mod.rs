//! Runtime client: the state machine between the daemon and the execution
//! backend.
//!
//! # Architecture
//!
//! ```text
//!  backend events ──► ingest lane (per id) ──► handle_event ─┐
//!                                                 │          │ under
//!  Daemon::start ──► start ──► create_container   │          │ per-id lock
//!                                                 ▼          │
//!                          RestartManager ◄── Exit          ─┘
//!                                                 │
//!                       notify lane (per id) ──► StateBridge::state_changed
//! ```
//!
//! Every transition for one container happens under that container's lock.
//! Notifications are queued while the lock is held and delivered by the
//! notify lane afterwards, so delivery order equals transition order and a
//! slow consumer never blocks event ingestion for other containers.

mod locks;
mod queue;
mod shadow;

pub use locks::KeyedMutex;
pub use queue::KeyedQueue;

use crate::bundle::OciSpec;
use crate::config::DaemonConfig;
use crate::constants::{EXIT_CODE_START_FAILED, INIT_PROCESS_ID, validate_container_id};
use crate::error::{Error, Result};
use crate::restart::{RestartDecision, RestartError, RestartManager, RestartWait};
use crate::runtime::{
    AddProcessRequest, BackendEvent, CreateRequest, EventKind, ExecutionBackend, ProcessSpec,
    Signal, StateBridge, StateInfo, StateKind,
};
use shadow::{ProcessShadow, Shadow, create_fifos, pipe_paths, remove_pipes};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Settings the client takes from the daemon config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Parent of per-container bundle directories.
    pub state_dir: PathBuf,
    /// Keep bundle directories after exit.
    pub no_clean: bool,
    /// Forwarded to the backend on create.
    pub no_pivot_root: bool,
}

impl ClientOptions {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            state_dir: config.exec_root.join("bundles"),
            no_clean: config.no_clean,
            no_pivot_root: config.no_pivot_root,
        }
    }
}

/// Tracks live containers on the execution backend.
pub struct Client {
    backend: Arc<dyn ExecutionBackend>,
    bridge: Weak<dyn StateBridge>,
    options: ClientOptions,
    locks: KeyedMutex,
    live: Mutex<HashMap<String, Shadow>>,
    /// Containers whose restart wait has not resolved yet.
    pending_restarts: Mutex<HashSet<String>>,
    ingest: KeyedQueue,
    notify: KeyedQueue,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("backend", &self.backend.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client. `bridge` is usually the owner of the client, hence
    /// the weak reference.
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        bridge: Weak<dyn StateBridge>,
        options: ClientOptions,
    ) -> Self {
        Self {
            backend,
            bridge,
            options,
            locks: KeyedMutex::new(),
            live: Mutex::new(HashMap::new()),
            pending_restarts: Mutex::new(HashSet::new()),
            ingest: KeyedQueue::new("ingest"),
            notify: KeyedQueue::new("notify"),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Returns true if the backend is running this container.
    pub fn is_live(&self, id: &str) -> bool {
        self.live().contains_key(id)
    }

    /// Returns true while an automatic restart is waiting out its backoff.
    pub fn is_restart_pending(&self, id: &str) -> bool {
        self.pending().contains(id)
    }

    /// IDs of live containers.
    pub fn live_ids(&self) -> Vec<String> {
        self.live().keys().cloned().collect()
    }

    /// Number of container IDs holding a per-container lock.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// System PID of a live container's init process.
    pub fn system_pid(&self, id: &str) -> Option<u32> {
        self.live().get(id).map(|s| s.system_pid)
    }

    /// Bundle directory used for a container.
    pub fn bundle_dir(&self, id: &str) -> PathBuf {
        self.options.state_dir.join(id)
    }

    // =========================================================================
    // Start
    // =========================================================================

    /// Starts a container on the backend and returns its system PID.
    ///
    /// On success a `Start` transition is queued for the bridge.
    pub async fn start(
        self: &Arc<Self>,
        id: &str,
        spec: OciSpec,
        restart_manager: Option<Arc<RestartManager>>,
    ) -> Result<u32> {
        validate_container_id(id).map_err(|reason| Error::InvalidName {
            name: id.to_string(),
            reason: reason.to_string(),
        })?;
        let _guard = self.locks.lock(id).await;

        let state = if self.is_live(id) {
            Some("running")
        } else if self.is_restart_pending(id) {
            Some("restarting")
        } else {
            None
        };
        if let Some(state) = state {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: state.to_string(),
                expected: "stopped".to_string(),
            });
        }

        let shadow = Shadow::new(id, self.bundle_dir(id), spec, restart_manager);
        self.launch(shadow).await
    }

    /// Registers `shadow` and issues the create RPC. Caller holds the lock.
    async fn launch(self: &Arc<Self>, shadow: Shadow) -> Result<u32> {
        let id = shadow.id.clone();
        if let Err(e) = shadow.prepare() {
            shadow.clean(self.options.no_clean);
            return Err(e);
        }

        let request = CreateRequest {
            id: id.clone(),
            bundle_path: shadow.dir.clone(),
            stdin: shadow.pipes.stdin.clone(),
            stdout: shadow.pipes.stdout.clone(),
            stderr: shadow.pipes.stderr.clone(),
            no_pivot_root: self.options.no_pivot_root,
        };
        let pipes = shadow.pipes.clone();
        self.live().insert(id.clone(), shadow);

        let pid = match self.backend.create_container(request).await {
            Ok(pid) => pid,
            Err(e) => {
                let removed = self.live().remove(&id);
                if let Some(shadow) = removed {
                    shadow.clean(self.options.no_clean);
                }
                return Err(e);
            }
        };

        if let Some(shadow) = self.live().get_mut(&id) {
            shadow.system_pid = pid;
            shadow.started_at = Some(Instant::now());
        }
        info!(container = %id, pid, "container started");

        if let Some(bridge) = self.bridge.upgrade()
            && let Err(e) = bridge.attach_streams(&id, pipes).await
        {
            warn!(container = %id, error = %e, "failed to attach streams");
        }

        let mut started = StateInfo::new(StateKind::Start);
        started.pid = Some(pid);
        self.notify(&id, started);
        Ok(pid)
    }

    // =========================================================================
    // Event Handling
    // =========================================================================

    /// Reconciles one backend event.
    ///
    /// Only exit, pause, resume and OOM events change state; others are
    /// logged and dropped, as are events for containers the client does not
    /// know.
    pub async fn handle_event(self: &Arc<Self>, event: BackendEvent) -> Result<()> {
        if let EventKind::Other(kind) = &event.kind {
            debug!(container = %event.container_id, kind = %kind, "ignoring backend event");
            return Ok(());
        }
        validate_container_id(&event.container_id).map_err(|reason| {
            Error::Backend(format!(
                "event for invalid container ID '{}': {}",
                event.container_id, reason
            ))
        })?;

        let id = event.container_id.clone();
        let _guard = self.locks.lock(&id).await;

        let info = match &event.kind {
            EventKind::Oom => {
                let known = self.live().get_mut(&id).map(|s| s.oom = true).is_some();
                if !known {
                    debug!(container = %id, "oom for unknown container");
                    return Ok(());
                }
                warn!(container = %id, "container ran out of memory");
                StateInfo::new(StateKind::Oom)
            }
            EventKind::Pause | EventKind::Resume => {
                if !self.is_live(&id) {
                    debug!(container = %id, kind = %event.kind, "event for unknown container");
                    return Ok(());
                }
                StateInfo::new(if event.kind == EventKind::Pause {
                    StateKind::Pause
                } else {
                    StateKind::Resume
                })
            }
            EventKind::Exit if event.process_id != INIT_PROCESS_ID => {
                self.handle_process_exit(&event)
            }
            EventKind::Exit => match self.handle_init_exit(&event) {
                Some(info) => info,
                None => return Ok(()),
            },
            EventKind::Other(_) => return Ok(()),
        };

        self.notify(&id, info);
        Ok(())
    }

    fn handle_process_exit(&self, event: &BackendEvent) -> StateInfo {
        let removed = self
            .live()
            .get_mut(&event.container_id)
            .and_then(|s| s.processes.remove(&event.process_id));
        match removed {
            Some(process) => {
                debug!(
                    container = %event.container_id,
                    process = %event.process_id,
                    pid = process.pid,
                    exit_code = event.exit_status,
                    "process exited"
                );
                if !self.options.no_clean {
                    remove_pipes(&process.pipes);
                }
            }
            None => warn!(
                container = %event.container_id,
                process = %event.process_id,
                "exit for unknown process"
            ),
        }
        StateInfo {
            state: StateKind::ExitProcess,
            exit_code: event.exit_status,
            oom_killed: false,
            process_id: Some(event.process_id.clone()),
            pid: None,
        }
    }

    fn handle_init_exit(self: &Arc<Self>, event: &BackendEvent) -> Option<StateInfo> {
        let id = &event.container_id;
        let removed = self.live().remove(id);
        let Some(mut shadow) = removed else {
            debug!(container = %id, "exit for unknown container");
            return None;
        };

        let mut info = StateInfo::new(StateKind::Exit);
        info.exit_code = event.exit_status;
        info.oom_killed = shadow.oom;
        info!(container = %id, exit_code = event.exit_status, oom = shadow.oom, "container exited");

        if let Some(rm) = shadow.restart_manager.clone() {
            match rm.should_restart(event.exit_status, false, shadow.uptime()) {
                Ok(RestartDecision::Restart { delay, wait }) => {
                    info!(
                        container = %id,
                        delay_ms = delay.as_millis() as u64,
                        restart_count = rm.restart_count(),
                        "scheduling restart"
                    );
                    shadow.restarting = true;
                    self.pending().insert(id.clone());
                    self.spawn_restart_waiter(shadow, wait, info.clone());
                    info.state = StateKind::Restart;
                    return Some(info);
                }
                Ok(RestartDecision::Stop) => {}
                Err(RestartError::Canceled) => {
                    debug!(container = %id, "restart canceled");
                }
                Err(e) => warn!(container = %id, error = %e, "restart evaluation failed"),
            }
        }

        shadow.clean(self.options.no_clean);
        Some(info)
    }

    /// Waits out the backoff, then starts the container again or, if the
    /// restart was cancelled, finalizes the exit.
    fn spawn_restart_waiter(self: &Arc<Self>, mut shadow: Shadow, wait: RestartWait, exit: StateInfo) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = wait.wait().await;
            let id = shadow.id.clone();
            let guard = client.locks.lock(&id).await;
            if !client.pending().remove(&id) {
                // Forgotten while waiting.
                debug!(container = %id, "dropping restart of removed container");
                shadow.clean(client.options.no_clean);
                drop(guard);
                client.locks.remove(&id);
                return;
            }

            match outcome {
                Ok(()) => {
                    shadow.reset_for_restart();
                    if let Err(e) = client.launch(shadow).await {
                        error!(container = %id, error = %e, "restart failed");
                        let mut info = StateInfo::new(StateKind::Exit);
                        info.exit_code = EXIT_CODE_START_FAILED as u32;
                        client.notify(&id, info);
                    }
                }
                Err(e) => {
                    if e == RestartError::Canceled {
                        debug!(container = %id, "pending restart canceled");
                    } else {
                        warn!(container = %id, error = %e, "restart wait failed");
                    }
                    shadow.clean(client.options.no_clean);
                    client.notify(&id, exit);
                }
            }
        });
    }

    /// Queues a transition for delivery to the bridge.
    fn notify(&self, id: &str, info: StateInfo) {
        let bridge = self.bridge.clone();
        let key = id;
        let id = id.to_string();
        self.notify.push(key, async move {
            let Some(bridge) = bridge.upgrade() else {
                return;
            };
            if let Err(e) = bridge.state_changed(&id, info).await {
                warn!(container = %id, error = %e, "state change delivery failed");
            }
        });
    }

    // =========================================================================
    // Auxiliary Processes and Control
    // =========================================================================

    /// Launches an auxiliary process in a live container.
    pub async fn add_process(
        self: &Arc<Self>,
        id: &str,
        process_id: &str,
        process: ProcessSpec,
    ) -> Result<u32> {
        validate_container_id(process_id).map_err(|reason| Error::InvalidName {
            name: process_id.to_string(),
            reason: reason.to_string(),
        })?;
        let _guard = self.locks.lock(id).await;

        let dir = {
            let live = self.live();
            let shadow = live
                .get(id)
                .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
            if process_id == INIT_PROCESS_ID || shadow.processes.contains_key(process_id) {
                return Err(Error::ProcessExists {
                    container: id.to_string(),
                    process: process_id.to_string(),
                });
            }
            shadow.dir.clone()
        };

        let pipes = pipe_paths(&dir, process_id, process.terminal);
        create_fifos(&pipes)?;
        if let Some(shadow) = self.live().get_mut(id) {
            shadow.processes.insert(
                process_id.to_string(),
                ProcessShadow {
                    pid: 0,
                    pipes: pipes.clone(),
                },
            );
        }

        let request = AddProcessRequest {
            container_id: id.to_string(),
            process_id: process_id.to_string(),
            process,
            stdin: pipes.stdin.clone(),
            stdout: pipes.stdout.clone(),
            stderr: pipes.stderr.clone(),
        };
        let pid = match self.backend.add_process(request).await {
            Ok(pid) => pid,
            Err(e) => {
                if let Some(shadow) = self.live().get_mut(id) {
                    shadow.processes.remove(process_id);
                }
                remove_pipes(&pipes);
                return Err(e);
            }
        };

        if let Some(p) = self
            .live()
            .get_mut(id)
            .and_then(|s| s.processes.get_mut(process_id))
        {
            p.pid = pid;
        }
        debug!(container = %id, process = %process_id, pid, "process added");

        if let Some(bridge) = self.bridge.upgrade()
            && let Err(e) = bridge.attach_streams(id, pipes).await
        {
            warn!(container = %id, process = %process_id, error = %e, "failed to attach streams");
        }
        Ok(pid)
    }

    /// Sends a signal to one process of a live container.
    pub async fn signal(&self, id: &str, process_id: &str, signal: Signal) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        self.ensure_live(id)?;
        debug!(container = %id, process = %process_id, %signal, "sending signal");
        self.backend.signal(id, process_id, signal).await
    }

    /// Freezes a live container.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        self.ensure_live(id)?;
        self.backend.set_paused(id, true).await
    }

    /// Thaws a paused container.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let _guard = self.locks.lock(id).await;
        self.ensure_live(id)?;
        self.backend.set_paused(id, false).await
    }

    /// Drops all per-container bookkeeping after removal.
    pub fn forget(&self, id: &str) {
        let removed = self.live().remove(id);
        if let Some(shadow) = removed {
            shadow.clean(self.options.no_clean);
        }
        self.pending().remove(id);
        self.locks.remove(id);
        self.ingest.remove(id);
        self.notify.remove(id);
    }

    // =========================================================================
    // Event Loop
    // =========================================================================

    /// Consumes the backend event subscription until it closes or
    /// `shutdown` fires. Events are handled on per-container lanes.
    pub async fn run_event_loop(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let mut events = self.backend.subscribe().await?;
        info!(backend = self.backend.name(), "subscribed to backend events");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        warn!("backend event stream closed");
                        break;
                    }
                },
            };
            let client = Arc::clone(&self);
            let key = event.container_id.clone();
            self.ingest.push(&key, async move {
                if let Err(e) = client.handle_event(event).await {
                    warn!(error = %e, "failed to handle backend event");
                }
            });
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn ensure_live(&self, id: &str) -> Result<()> {
        if self.is_live(id) {
            return Ok(());
        }
        if self.is_restart_pending(id) {
            return Err(Error::InvalidState {
                id: id.to_string(),
                state: "restarting".to_string(),
                expected: "running".to_string(),
            });
        }
        Err(Error::ContainerNotFound(id.to_string()))
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Shadow>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending_restarts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}
