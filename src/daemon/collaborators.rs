//! Interfaces of the subsystems the daemon orchestrates but does not own.
//!
//! Images, writable layers, volumes, networking and security labels are each
//! behind a trait so the lifecycle logic can be exercised against in-memory
//! fakes and composed with real implementations in the binary.

use crate::container::{EndpointConfig, NetworkSettings};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Images
// =============================================================================

/// Image defaults merged into a container config at create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: Vec<String>,
    pub working_dir: String,
    pub user: String,
    /// Anonymous volume destinations declared by the image.
    pub volumes: Vec<String>,
}

/// A resolved image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    /// Chain ID of the top layer.
    pub chain_id: String,
    #[serde(default)]
    pub config: ImageConfig,
}

/// Resolves image references.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Returns the image for `reference`, or [`Error::ImageNotFound`].
    ///
    /// [`Error::ImageNotFound`]: crate::Error::ImageNotFound
    async fn get_image(&self, reference: &str) -> Result<Image>;
}

// =============================================================================
// Layers
// =============================================================================

/// Callback that populates a new init layer.
pub type InitLayerFn<'a> = &'a (dyn Fn(&Path) -> Result<()> + Send + Sync);

/// Per-container writable filesystem layers.
#[async_trait]
pub trait LayerStore: Send + Sync {
    /// Creates a writable layer for container `id` on top of `chain_id`.
    /// Returns the layer handle.
    async fn create_rw_layer(
        &self,
        id: &str,
        chain_id: &str,
        mount_label: &str,
        init: InitLayerFn<'_>,
    ) -> Result<String>;

    /// Mounts the layer and returns the root filesystem path.
    async fn mount(&self, layer: &str, mount_label: &str) -> Result<PathBuf>;

    /// Unmounts the layer.
    async fn unmount(&self, layer: &str) -> Result<()>;

    /// Returns the mount ID used for forced cleanup of a container's mounts.
    async fn get_mount_id(&self, container_id: &str) -> Result<String>;

    /// Deletes the layer.
    async fn release_rw_layer(&self, layer: &str) -> Result<()>;
}

// =============================================================================
// Volumes
// =============================================================================

/// A volume handed out by the volume store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub name: String,
    pub driver: String,
    pub mountpoint: PathBuf,
}

/// Reference-counted named and anonymous volumes.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Gets or creates a volume and records `reference` against it. A
    /// `None` name creates an anonymous volume.
    async fn create_with_ref(
        &self,
        name: Option<&str>,
        driver: &str,
        reference: &str,
    ) -> Result<Volume>;

    /// Drops `reference` from the volume.
    async fn dereference(&self, name: &str, reference: &str) -> Result<()>;

    /// Deletes an unreferenced volume.
    async fn remove(&self, name: &str) -> Result<()>;
}

// =============================================================================
// Networking
// =============================================================================

/// Attachment request for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub container_id: String,
    pub name: String,
    pub hostname: String,
    pub network_mode: String,
    pub endpoints: BTreeMap<String, EndpointConfig>,
}

/// Network controller.
#[async_trait]
pub trait NetworkController: Send + Sync {
    /// Creates a sandbox and joins the requested networks.
    async fn attach(&self, request: &AttachRequest) -> Result<NetworkSettings>;

    /// Leaves all networks and deletes the sandbox.
    async fn release(&self, container_id: &str) -> Result<()>;
}

// =============================================================================
// Security Labels
// =============================================================================

/// Labels assigned to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels {
    pub process_label: String,
    pub mount_label: String,
}

/// Security-label subsystem.
pub trait SecurityLabeler: Send + Sync {
    /// Parses `security_opt` and reserves labels.
    fn init_labels(&self, security_opt: &[String]) -> Result<Labels>;

    /// Releases a reserved label.
    fn release_labels(&self, mount_label: &str);
}

// =============================================================================
// Composition
// =============================================================================

/// All collaborators, shared by `Arc`.
#[derive(Clone)]
pub struct Collaborators {
    pub images: Arc<dyn ImageStore>,
    pub layers: Arc<dyn LayerStore>,
    pub volumes: Arc<dyn VolumeStore>,
    pub network: Arc<dyn NetworkController>,
    pub labels: Arc<dyn SecurityLabeler>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
