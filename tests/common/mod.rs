//! Shared fakes for the integration tests.
//!
//! Every collaborator of the daemon has an in-memory stand-in here. The
//! backend is scripted: create errors are queued ahead of time, signals turn
//! into exit events, and tests inject arbitrary events.

#![allow(dead_code)]

use async_trait::async_trait;
use berth::bundle::{OciSpec, SpecBuilder};
use berth::container::{Container, EndpointSettings, NetworkSettings, RunState};
use berth::daemon::{
    AttachRequest, Collaborators, Image, ImageConfig, ImageStore, InitLayerFn, Labels, LayerStore,
    NetworkController, SecurityLabeler, Volume, VolumeStore,
};
use berth::runtime::{
    AddProcessRequest, BackendEvent, CreateRequest, EventKind, ExecutionBackend, IoPipes, Signal,
    StateBridge, StateInfo,
};
use berth::{ContainerConfig, CreateParams, Daemon, DaemonConfig, Error, PlatformOps, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Upper bound for every wait in the tests.
pub const WAIT: Duration = Duration::from_secs(10);

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Polls `check` until it holds, panicking after [`WAIT`].
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Scripted execution backend.
pub struct FakeBackend {
    tx: mpsc::Sender<BackendEvent>,
    rx: Mutex<Option<mpsc::Receiver<BackendEvent>>>,
    next_pid: AtomicU32,
    create_errors: Mutex<VecDeque<String>>,
    pub creates: Mutex<Vec<CreateRequest>>,
    pub signals: Mutex<Vec<(String, String, Signal)>>,
    pub processes: Mutex<Vec<AddProcessRequest>>,
    /// When set, SIGTERM is ignored and only SIGKILL produces an exit.
    pub ignore_term: AtomicBool,
    /// When set, signals never produce an exit.
    pub ignore_signals: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1024);
        Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            next_pid: AtomicU32::new(1000),
            create_errors: Mutex::new(VecDeque::new()),
            creates: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            processes: Mutex::new(Vec::new()),
            ignore_term: AtomicBool::new(false),
            ignore_signals: AtomicBool::new(false),
        })
    }

    /// Makes the next create call fail with `message`.
    pub fn fail_next_create(&self, message: &str) {
        lock(&self.create_errors).push_back(message.to_string());
    }

    pub fn create_count(&self) -> usize {
        lock(&self.creates).len()
    }

    pub fn signal_list(&self) -> Vec<Signal> {
        lock(&self.signals).iter().map(|(_, _, s)| *s).collect()
    }

    /// Injects an event on the subscription stream.
    pub fn emit(&self, container_id: &str, process_id: &str, kind: EventKind, exit_status: u32) {
        let _ = self.tx.try_send(BackendEvent {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
            kind,
            exit_status,
        });
    }

    /// Reports an exit of the container's init process.
    pub fn exit(&self, container_id: &str, exit_status: u32) {
        self.emit(container_id, "init", EventKind::Exit, exit_status);
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_container(&self, request: CreateRequest) -> Result<u32> {
        lock(&self.creates).push(request);
        if let Some(message) = lock(&self.create_errors).pop_front() {
            return Err(Error::Backend(message));
        }
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>> {
        lock(&self.rx)
            .take()
            .ok_or_else(|| Error::Backend("already subscribed".to_string()))
    }

    async fn signal(&self, container_id: &str, process_id: &str, signal: Signal) -> Result<()> {
        lock(&self.signals).push((container_id.to_string(), process_id.to_string(), signal));
        let exits = match signal {
            Signal::Kill => true,
            Signal::Term => !self.ignore_term.load(Ordering::SeqCst),
            _ => false,
        };
        if exits && !self.ignore_signals.load(Ordering::SeqCst) {
            self.emit(
                container_id,
                process_id,
                EventKind::Exit,
                128 + signal.as_i32() as u32,
            );
        }
        Ok(())
    }

    async fn add_process(&self, request: AddProcessRequest) -> Result<u32> {
        lock(&self.processes).push(request);
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }

    async fn set_paused(&self, container_id: &str, paused: bool) -> Result<()> {
        let kind = if paused {
            EventKind::Pause
        } else {
            EventKind::Resume
        };
        self.emit(container_id, "init", kind, 0);
        Ok(())
    }
}

// =============================================================================
// Images
// =============================================================================

pub struct FakeImages {
    images: HashMap<String, Image>,
}

impl FakeImages {
    pub fn new() -> Self {
        let mut images = HashMap::new();
        images.insert(
            "busybox".to_string(),
            Image {
                id: "sha256:busybox".to_string(),
                chain_id: "chain-busybox".to_string(),
                config: ImageConfig {
                    cmd: vec!["sh".to_string()],
                    env: vec!["PATH=/bin".to_string(), "HOME=/root".to_string()],
                    ..ImageConfig::default()
                },
            },
        );
        images.insert(
            "postgres".to_string(),
            Image {
                id: "sha256:postgres".to_string(),
                chain_id: "chain-postgres".to_string(),
                config: ImageConfig {
                    entrypoint: vec!["docker-entrypoint.sh".to_string()],
                    cmd: vec!["postgres".to_string()],
                    volumes: vec!["/var/lib/postgresql/data".to_string()],
                    ..ImageConfig::default()
                },
            },
        );
        Self { images }
    }
}

#[async_trait]
impl ImageStore for FakeImages {
    async fn get_image(&self, reference: &str) -> Result<Image> {
        self.images
            .get(reference)
            .cloned()
            .ok_or_else(|| Error::ImageNotFound(reference.to_string()))
    }
}

// =============================================================================
// Layers
// =============================================================================

pub struct FakeLayers {
    root: PathBuf,
    pub created: Mutex<Vec<String>>,
    pub released: Mutex<Vec<String>>,
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_unmount: AtomicBool,
}

impl FakeLayers {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            created: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            mounts: AtomicUsize::new(0),
            unmounts: AtomicUsize::new(0),
            fail_create: AtomicBool::new(false),
            fail_unmount: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LayerStore for FakeLayers {
    async fn create_rw_layer(
        &self,
        id: &str,
        _chain_id: &str,
        _mount_label: &str,
        init: InitLayerFn<'_>,
    ) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Error::Storage("layer store is full".to_string()));
        }
        let dir = self.root.join(id);
        std::fs::create_dir_all(dir.join("init"))?;
        std::fs::create_dir_all(dir.join("rootfs"))?;
        init(&dir.join("init"))?;
        lock(&self.created).push(id.to_string());
        Ok(id.to_string())
    }

    async fn mount(&self, layer: &str, _mount_label: &str) -> Result<PathBuf> {
        self.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(self.root.join(layer).join("rootfs"))
    }

    async fn unmount(&self, _layer: &str) -> Result<()> {
        self.unmounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_unmount.load(Ordering::SeqCst) {
            return Err(Error::Storage("device or resource busy".to_string()));
        }
        Ok(())
    }

    async fn get_mount_id(&self, container_id: &str) -> Result<String> {
        Ok(format!("mnt-{}", container_id))
    }

    async fn release_rw_layer(&self, layer: &str) -> Result<()> {
        lock(&self.released).push(layer.to_string());
        Ok(())
    }
}

// =============================================================================
// Volumes
// =============================================================================

pub struct FakeVolumes {
    root: PathBuf,
    refs: Mutex<HashMap<String, HashSet<String>>>,
    pub removed: Mutex<Vec<String>>,
    counter: AtomicUsize,
    /// Volume names whose creation fails.
    pub fail_names: Mutex<HashSet<String>>,
    /// Fail anonymous volume creation.
    pub fail_anonymous: AtomicBool,
}

impl FakeVolumes {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            refs: Mutex::new(HashMap::new()),
            removed: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            fail_names: Mutex::new(HashSet::new()),
            fail_anonymous: AtomicBool::new(false),
        }
    }

    pub fn ref_count(&self, name: &str) -> usize {
        lock(&self.refs).get(name).map_or(0, HashSet::len)
    }

    /// Total references held across all volumes.
    pub fn total_refs(&self) -> usize {
        lock(&self.refs).values().map(HashSet::len).sum()
    }
}

#[async_trait]
impl VolumeStore for FakeVolumes {
    async fn create_with_ref(
        &self,
        name: Option<&str>,
        driver: &str,
        reference: &str,
    ) -> Result<Volume> {
        let name = match name {
            Some(name) => {
                if lock(&self.fail_names).contains(name) {
                    return Err(Error::Volume(format!("cannot create volume {}", name)));
                }
                name.to_string()
            }
            None => {
                if self.fail_anonymous.load(Ordering::SeqCst) {
                    return Err(Error::Volume("cannot create anonymous volume".to_string()));
                }
                format!("anon{}", self.counter.fetch_add(1, Ordering::SeqCst))
            }
        };
        lock(&self.refs)
            .entry(name.clone())
            .or_default()
            .insert(reference.to_string());
        Ok(Volume {
            mountpoint: self.root.join(&name),
            name,
            driver: driver.to_string(),
        })
    }

    async fn dereference(&self, name: &str, reference: &str) -> Result<()> {
        if let Some(holders) = lock(&self.refs).get_mut(name) {
            holders.remove(reference);
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut refs = lock(&self.refs);
        if refs.get(name).is_some_and(|h| !h.is_empty()) {
            return Err(Error::Volume(format!("volume {} is in use", name)));
        }
        refs.remove(name);
        lock(&self.removed).push(name.to_string());
        Ok(())
    }
}

// =============================================================================
// Network and Labels
// =============================================================================

#[derive(Default)]
pub struct FakeNetwork {
    pub attached: Mutex<Vec<AttachRequest>>,
    pub released: Mutex<Vec<String>>,
    pub fail_attach: AtomicBool,
}

#[async_trait]
impl NetworkController for FakeNetwork {
    async fn attach(&self, request: &AttachRequest) -> Result<NetworkSettings> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(Error::Network("no addresses left".to_string()));
        }
        lock(&self.attached).push(request.clone());
        let mut settings = NetworkSettings {
            sandbox_key: Some(format!("/var/run/netns/{}", &request.container_id[..12])),
            ..NetworkSettings::default()
        };
        for (name, endpoint) in &request.endpoints {
            settings.networks.insert(
                name.clone(),
                EndpointSettings {
                    endpoint_id: format!("ep-{}", name),
                    ip_address: "10.0.0.2".to_string(),
                    gateway: "10.0.0.1".to_string(),
                    aliases: endpoint.aliases.clone(),
                    ..EndpointSettings::default()
                },
            );
        }
        Ok(settings)
    }

    async fn release(&self, container_id: &str) -> Result<()> {
        lock(&self.released).push(container_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLabels {
    pub released: Mutex<Vec<String>>,
}

impl SecurityLabeler for FakeLabels {
    fn init_labels(&self, security_opt: &[String]) -> Result<Labels> {
        if security_opt.iter().any(|o| o == "label=disable") {
            return Ok(Labels::default());
        }
        Ok(Labels {
            process_label: "system_u:system_r:container_t:s0".to_string(),
            mount_label: "system_u:object_r:container_file_t:s0".to_string(),
        })
    }

    fn release_labels(&self, mount_label: &str) {
        lock(&self.released).push(mount_label.to_string());
    }
}

// =============================================================================
// Platform
// =============================================================================

/// Platform that records calls instead of touching mounts.
#[derive(Default)]
pub struct RecordingPlatform {
    pub ipc_setups: AtomicUsize,
    pub ipc_unmounts: AtomicUsize,
    pub forced_cleanups: Mutex<Vec<String>>,
    pub volume_unmounts: AtomicUsize,
    pub specs: Mutex<Vec<OciSpec>>,
}

#[async_trait]
impl PlatformOps for RecordingPlatform {
    fn setup_init_layer(&self, init_root: &Path) -> Result<()> {
        std::fs::create_dir_all(init_root.join("etc"))?;
        Ok(())
    }

    async fn setup_ipc_mounts(&self, container: &mut Container) -> Result<()> {
        self.ipc_setups.fetch_add(1, Ordering::SeqCst);
        let shm = container.root.join("shm");
        std::fs::create_dir_all(&shm)?;
        container.shm_path = Some(shm);
        Ok(())
    }

    async fn unmount_ipc_mounts(&self, _container: &Container) -> Result<()> {
        self.ipc_unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cleanup_mounts_by_id(&self, mount_id: &str) -> Result<()> {
        lock(&self.forced_cleanups).push(mount_id.to_string());
        Ok(())
    }

    async fn unmount_volumes(&self, _container: &Container) -> Result<()> {
        self.volume_unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn create_spec(&self, container: &Container) -> Result<OciSpec> {
        let rootfs = container
            .base_fs
            .clone()
            .ok_or_else(|| Error::Internal("rootfs not mounted".to_string()))?;
        let spec = SpecBuilder::new(container, rootfs).build()?;
        lock(&self.specs).push(spec.clone());
        Ok(spec)
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Bridge that records everything the client reports.
#[derive(Default)]
pub struct RecordingBridge {
    pub states: Mutex<Vec<(String, StateInfo)>>,
    pub attached: Mutex<Vec<(String, IoPipes)>>,
    /// Delay applied inside `state_changed`, to expose ordering bugs.
    pub delay: Mutex<Option<Duration>>,
}

impl RecordingBridge {
    pub fn states_for(&self, id: &str) -> Vec<StateInfo> {
        lock(&self.states)
            .iter()
            .filter(|(cid, _)| cid == id)
            .map(|(_, info)| info.clone())
            .collect()
    }

    /// Waits until `n` transitions have been delivered for `id`.
    pub async fn wait_for_states(&self, id: &str, n: usize) -> Vec<StateInfo> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let states = self.states_for(id);
            if states.len() >= n {
                return states;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} states of {}, got {:?}",
                n,
                id,
                states
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl StateBridge for RecordingBridge {
    async fn state_changed(&self, id: &str, info: StateInfo) -> Result<()> {
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.states).push((id.to_string(), info));
        Ok(())
    }

    async fn attach_streams(&self, id: &str, pipes: IoPipes) -> Result<()> {
        lock(&self.attached).push((id.to_string(), pipes));
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A daemon wired to fakes, with its event loop running.
pub struct Harness {
    pub dir: TempDir,
    pub daemon: Arc<Daemon>,
    pub backend: Arc<FakeBackend>,
    pub layers: Arc<FakeLayers>,
    pub volumes: Arc<FakeVolumes>,
    pub network: Arc<FakeNetwork>,
    pub labels: Arc<FakeLabels>,
    pub platform: Arc<RecordingPlatform>,
    pub shutdown: CancellationToken,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = DaemonConfig::with_root(dir.path().join("lib"));
        adjust(&mut config);
        Self::build(dir, config, FakeBackend::new()).await
    }

    /// Builds a second daemon over the same state directory, as after a
    /// daemon restart.
    pub async fn reopen(self) -> Self {
        let config = self.daemon.config().clone();
        self.shutdown.cancel();
        let Harness { dir, .. } = self;
        Self::build(dir, config, FakeBackend::new()).await
    }

    async fn build(dir: TempDir, config: DaemonConfig, backend: Arc<FakeBackend>) -> Self {
        let layers = Arc::new(FakeLayers::new(dir.path().join("layers")));
        let volumes = Arc::new(FakeVolumes::new(dir.path().join("volumes")));
        let network = Arc::new(FakeNetwork::default());
        let labels = Arc::new(FakeLabels::default());
        let platform = Arc::new(RecordingPlatform::default());
        let collaborators = Collaborators {
            images: Arc::new(FakeImages::new()),
            layers: layers.clone(),
            volumes: volumes.clone(),
            network: network.clone(),
            labels: labels.clone(),
        };
        let daemon = Daemon::new(
            Arc::new(config),
            backend.clone(),
            collaborators,
            platform.clone(),
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        daemon.spawn_event_loop(shutdown.clone());
        Self {
            dir,
            daemon,
            backend,
            layers,
            volumes,
            network,
            labels,
            platform,
            shutdown,
        }
    }

    /// Creates a busybox container and returns its ID.
    pub async fn create(&self, name: &str) -> String {
        self.create_with(name, |_| {}).await
    }

    pub async fn create_with(
        &self,
        name: &str,
        adjust: impl FnOnce(&mut CreateParams),
    ) -> String {
        let mut params = CreateParams {
            name: Some(name.to_string()),
            config: Some(ContainerConfig {
                image: "busybox".to_string(),
                cmd: vec!["sleep".to_string(), "1000".to_string()],
                ..ContainerConfig::default()
            }),
            ..CreateParams::default()
        };
        adjust(&mut params);
        self.daemon.create(params).await.unwrap().id
    }

    /// Waits until the published status of `id` satisfies `pred`.
    pub async fn wait_status(&self, id: &str, pred: impl Fn(RunState) -> bool) -> RunState {
        let handle = self.daemon.store().get(id).unwrap();
        let mut rx = handle.subscribe_status();
        let result = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s.status))).await;
        match result {
            Ok(Ok(snapshot)) => snapshot.status,
            _ => panic!("timed out waiting for status of {}, at {:?}", id, handle.status()),
        }
    }

    pub async fn wait_for(&self, id: &str, status: RunState) {
        self.wait_status(id, |s| s == status).await;
    }
}
