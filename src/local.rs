//! # Directory-Backed Collaborators
//!
//! Minimal implementations of the daemon's collaborator traits used by
//! `berthd`. Everything lives under one state directory:
//!
//! ```text
//! <root>/
//! ├── images/<reference>/image.json   image metadata
//! ├── base/<chain_id>/                unpacked top layer, copied into new layers
//! ├── layers/<container>/
//! │   ├── init/                       populated by the init-layer callback
//! │   └── diff/                       writable root filesystem
//! └── volumes/<name>/_data/           volume contents
//! ```
//!
//! Layers are plain directory copies (no union mounts), networking stays on
//! the host loopback, and security labels are disabled. These are enough to
//! run the daemon against a backend that does its own isolation.

use crate::container::{EndpointSettings, NetworkSettings};
use crate::daemon::{
    AttachRequest, Image, ImageStore, InitLayerFn, Labels, LayerStore, NetworkController,
    SecurityLabeler, Volume, VolumeStore,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

const IMAGES_DIR: &str = "images";
const BASE_DIR: &str = "base";
const LAYERS_DIR: &str = "layers";
const VOLUMES_DIR: &str = "volumes";
const IMAGE_FILE: &str = "image.json";
const LOCAL_DRIVER: &str = "local";

/// Returns a random 64-character hex identifier.
fn random_hex_id() -> String {
    hex::encode(Sha256::digest(uuid::Uuid::new_v4().as_bytes()))
}

/// Rejects path components that would escape their parent directory.
fn safe_component(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() || value == "." || value == ".." || value.contains('/') {
        return Err(Error::Storage(format!("invalid {} '{}'", kind, value)));
    }
    Ok(())
}

// =============================================================================
// Images
// =============================================================================

/// Image metadata read from `images/<reference>/image.json`.
///
/// Reference separators (`/` and `:`) are flattened to `_` in the directory
/// name, so `library/alpine:3` lives in `images/library_alpine_3`.
#[derive(Debug, Clone)]
pub struct LocalImageStore {
    root: PathBuf,
}

impl LocalImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of the metadata file for `reference`.
    pub fn image_path(&self, reference: &str) -> PathBuf {
        let dir: String = reference
            .chars()
            .map(|c| if c == '/' || c == ':' || c == '@' { '_' } else { c })
            .collect();
        self.root.join(IMAGES_DIR).join(dir).join(IMAGE_FILE)
    }
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn get_image(&self, reference: &str) -> Result<Image> {
        if reference.is_empty() || reference.contains("..") {
            return Err(Error::ImageNotFound(reference.to_string()));
        }
        let path = self.image_path(reference);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::ImageNotFound(reference.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| {
            Error::Storage(format!("corrupt image metadata {}: {}", path.display(), e))
        })
    }
}

// =============================================================================
// Layers
// =============================================================================

/// Writable layers as directory copies of the image's base tree.
#[derive(Debug, Clone)]
pub struct LocalLayerStore {
    root: PathBuf,
}

impl LocalLayerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn layer_dir(&self, layer: &str) -> Result<PathBuf> {
        safe_component("layer", layer)?;
        Ok(self.root.join(LAYERS_DIR).join(layer))
    }
}

#[async_trait]
impl LayerStore for LocalLayerStore {
    async fn create_rw_layer(
        &self,
        id: &str,
        chain_id: &str,
        _mount_label: &str,
        init: InitLayerFn<'_>,
    ) -> Result<String> {
        let dir = self.layer_dir(id)?;
        let init_dir = dir.join("init");
        let diff_dir = dir.join("diff");
        tokio::fs::create_dir_all(&init_dir).await?;
        tokio::fs::create_dir_all(&diff_dir).await?;
        init(&init_dir)?;

        if !chain_id.is_empty() {
            safe_component("chain ID", chain_id)?;
            let base = self.root.join(BASE_DIR).join(chain_id);
            if base.is_dir() {
                debug!(layer = %id, base = %base.display(), "copying base layer");
                let target = diff_dir.clone();
                tokio::task::spawn_blocking(move || copy_tree(&base, &target))
                    .await
                    .map_err(|e| Error::Internal(format!("layer copy task failed: {}", e)))??;
            }
        }
        Ok(id.to_string())
    }

    async fn mount(&self, layer: &str, _mount_label: &str) -> Result<PathBuf> {
        let diff = self.layer_dir(layer)?.join("diff");
        if !diff.is_dir() {
            return Err(Error::Storage(format!("layer {} does not exist", layer)));
        }
        Ok(diff)
    }

    async fn unmount(&self, _layer: &str) -> Result<()> {
        Ok(())
    }

    async fn get_mount_id(&self, container_id: &str) -> Result<String> {
        let dir = self.layer_dir(container_id)?;
        if dir.is_dir() {
            Ok(container_id.to_string())
        } else {
            Err(Error::Storage(format!(
                "no layer for container {}",
                container_id
            )))
        }
    }

    async fn release_rw_layer(&self, layer: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.layer_dir(layer)?).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Recursively copies `src` into `dst`, keeping symlinks as links.
fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let kind = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if kind.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if kind.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

// =============================================================================
// Volumes
// =============================================================================

/// Volumes as directories, reference-counted in memory.
#[derive(Debug)]
pub struct LocalVolumeStore {
    root: PathBuf,
    refs: Mutex<HashMap<String, HashSet<String>>>,
}

impl LocalVolumeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            refs: Mutex::new(HashMap::new()),
        }
    }

    fn volume_dir(&self, name: &str) -> PathBuf {
        self.root.join(VOLUMES_DIR).join(name)
    }

    /// Number of references held on `name`.
    pub fn ref_count(&self, name: &str) -> usize {
        self.refs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, HashSet::len)
    }
}

#[async_trait]
impl VolumeStore for LocalVolumeStore {
    async fn create_with_ref(
        &self,
        name: Option<&str>,
        driver: &str,
        reference: &str,
    ) -> Result<Volume> {
        if driver != LOCAL_DRIVER {
            return Err(Error::Volume(format!(
                "volume driver '{}' is not supported",
                driver
            )));
        }
        let name = match name {
            Some(name) => {
                safe_component("volume name", name).map_err(|_| {
                    Error::Volume(format!("invalid volume name '{}'", name))
                })?;
                name.to_string()
            }
            None => random_hex_id(),
        };
        let mountpoint = self.volume_dir(&name).join("_data");
        tokio::fs::create_dir_all(&mountpoint).await?;

        let created = {
            let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
            let holders = refs.entry(name.clone()).or_default();
            let created = holders.is_empty();
            holders.insert(reference.to_string());
            created
        };
        if created {
            debug!(volume = %name, "volume referenced");
        }
        Ok(Volume {
            name,
            driver: driver.to_string(),
            mountpoint,
        })
    }

    async fn dereference(&self, name: &str, reference: &str) -> Result<()> {
        let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(holders) = refs.get_mut(name) else {
            return Err(Error::Volume(format!("no such volume: {}", name)));
        };
        holders.remove(reference);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        {
            let mut refs = self.refs.lock().unwrap_or_else(|e| e.into_inner());
            if refs.get(name).is_some_and(|holders| !holders.is_empty()) {
                return Err(Error::Volume(format!("volume {} is in use", name)));
            }
            refs.remove(name);
        }
        safe_component("volume name", name)?;
        match tokio::fs::remove_dir_all(self.volume_dir(name)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => {
                info!(volume = %name, "volume removed");
                Ok(())
            }
        }
    }
}

// =============================================================================
// Networking
// =============================================================================

/// Network controller that hands out endpoints without creating interfaces.
///
/// Containers share the host network namespace, so no sandbox key is set.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork;

#[async_trait]
impl NetworkController for LoopbackNetwork {
    async fn attach(&self, request: &AttachRequest) -> Result<NetworkSettings> {
        let mut settings = NetworkSettings::default();
        let mut requested: Vec<(&String, Vec<String>)> = request
            .endpoints
            .iter()
            .map(|(name, endpoint)| (name, endpoint.aliases.clone()))
            .collect();
        if requested.is_empty() {
            requested.push((&request.network_mode, Vec::new()));
        }
        for (network, aliases) in requested {
            settings.networks.insert(
                network.clone(),
                EndpointSettings {
                    endpoint_id: random_hex_id(),
                    ip_address: "127.0.0.1".to_string(),
                    aliases,
                    ..EndpointSettings::default()
                },
            );
        }
        debug!(
            container = %request.container_id,
            networks = settings.networks.len(),
            "endpoints attached"
        );
        Ok(settings)
    }

    async fn release(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Security Labels
// =============================================================================

/// Labeler for hosts without a security module: every label is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLabels;

impl SecurityLabeler for NoLabels {
    fn init_labels(&self, _security_opt: &[String]) -> Result<Labels> {
        Ok(Labels::default())
    }

    fn release_labels(&self, _mount_label: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_image_not_found() {
        let dir = TempDir::new().unwrap();
        let store = LocalImageStore::new(dir.path());
        let err = store.get_image("alpine:3").await.unwrap_err();
        assert!(matches!(err, Error::ImageNotFound(r) if r == "alpine:3"));
    }

    #[tokio::test]
    async fn test_image_lookup() {
        let dir = TempDir::new().unwrap();
        let store = LocalImageStore::new(dir.path());
        let path = store.image_path("library/alpine:3");
        assert!(path.ends_with("images/library_alpine_3/image.json"));
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"id":"sha256:aa","chain_id":"bb","config":{"cmd":["sh"]}}"#,
        )
        .unwrap();

        let image = store.get_image("library/alpine:3").await.unwrap();
        assert_eq!(image.chain_id, "bb");
        assert_eq!(image.config.cmd, vec!["sh".to_string()]);
    }

    #[tokio::test]
    async fn test_layer_copies_base_and_runs_init() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join(BASE_DIR).join("chain1");
        fs::create_dir_all(base.join("bin")).unwrap();
        fs::write(base.join("bin/sh"), b"#!").unwrap();

        let store = LocalLayerStore::new(dir.path());
        let layer = store
            .create_rw_layer("c1", "chain1", "", &|p: &Path| {
                fs::write(p.join(".initialized"), b"")?;
                Ok(())
            })
            .await
            .unwrap();

        let rootfs = store.mount(&layer, "").await.unwrap();
        assert!(rootfs.join("bin/sh").is_file());
        assert!(dir.path().join("layers/c1/init/.initialized").exists());
        assert_eq!(store.get_mount_id("c1").await.unwrap(), "c1");

        store.release_rw_layer(&layer).await.unwrap();
        assert!(store.mount(&layer, "").await.is_err());
        // Releasing twice is fine.
        store.release_rw_layer(&layer).await.unwrap();
    }

    #[tokio::test]
    async fn test_layer_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let store = LocalLayerStore::new(dir.path());
        assert!(store.mount("../etc", "").await.is_err());
    }

    #[tokio::test]
    async fn test_volume_ref_counting() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumeStore::new(dir.path());

        let vol = store.create_with_ref(Some("data"), "local", "c1").await.unwrap();
        assert!(vol.mountpoint.is_dir());
        store.create_with_ref(Some("data"), "local", "c2").await.unwrap();
        assert_eq!(store.ref_count("data"), 2);

        store.dereference("data", "c1").await.unwrap();
        assert!(matches!(store.remove("data").await, Err(Error::Volume(_))));

        store.dereference("data", "c2").await.unwrap();
        store.remove("data").await.unwrap();
        assert!(!vol.mountpoint.exists());
    }

    #[tokio::test]
    async fn test_anonymous_volume_and_driver() {
        let dir = TempDir::new().unwrap();
        let store = LocalVolumeStore::new(dir.path());

        let vol = store.create_with_ref(None, "local", "c1").await.unwrap();
        assert_eq!(vol.name.len(), 64);

        let err = store
            .create_with_ref(Some("x"), "nfs", "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Volume(_)));
    }

    #[tokio::test]
    async fn test_loopback_attach() {
        let mut endpoints = std::collections::BTreeMap::new();
        endpoints.insert(
            "front".to_string(),
            crate::container::EndpointConfig {
                aliases: vec!["web".to_string()],
                ip_address: None,
            },
        );
        let settings = LoopbackNetwork
            .attach(&AttachRequest {
                container_id: "c1".to_string(),
                name: "/web".to_string(),
                hostname: "c1".to_string(),
                network_mode: "bridge".to_string(),
                endpoints,
            })
            .await
            .unwrap();
        assert!(settings.is_attached());
        assert_eq!(settings.networks["front"].aliases, vec!["web".to_string()]);
        assert!(settings.sandbox_key.is_none());
    }
}
