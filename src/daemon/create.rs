//! Container creation.
//!
//! Create validates everything it can before touching any state, then
//! registers the record and provisions it step by step. A failure after
//! registration removes the partially-created container again.

use super::Daemon;
use crate::bundle::create_private_dir;
use crate::constants::{
    MAX_CPU_SHARES, MIN_CPU_SHARES, MIN_MEMORY_LIMIT, SHORT_ID_LEN, validate_container_name,
};
use crate::container::{
    Container, ContainerConfig, HostConfig, Link, MountPoint, NetworkSettings, NetworkingConfig,
    connected_container,
};
use crate::daemon::collaborators::ImageConfig;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Volume driver used for volumes created implicitly.
pub(super) const DEFAULT_VOLUME_DRIVER: &str = "local";

/// Security option that turns labeling off.
const LABEL_DISABLE: &str = "label=disable";

/// Attempts before giving up on a unique ID or name.
const MAX_GENERATE_ATTEMPTS: usize = 10;

const NAME_ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "dapper", "eager", "fancy", "gentle", "happy", "jolly", "keen",
    "lucid", "merry", "nimble", "patient", "quiet", "rapid", "serene", "tender", "upbeat",
    "vivid", "witty", "zealous",
];

const NAME_NOUNS: &[&str] = &[
    "anchor", "buoy", "canal", "dock", "estuary", "ferry", "galley", "harbor", "island", "jetty",
    "keel", "lagoon", "mooring", "narrows", "outpost", "pier", "quay", "reef", "schooner",
    "tide", "wharf", "yawl",
];

/// Parameters of a create request.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    /// Requested name; generated when absent.
    pub name: Option<String>,
    pub config: Option<ContainerConfig>,
    pub host_config: HostConfig,
    pub networking_config: NetworkingConfig,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

impl Daemon {
    /// Creates a container.
    ///
    /// # Errors
    ///
    /// Validation errors leave no trace. Errors after registration are
    /// returned after the container has been removed again.
    pub async fn create(&self, params: CreateParams) -> Result<CreateResponse> {
        let CreateParams {
            name,
            config,
            mut host_config,
            networking_config,
        } = params;
        let mut config = config.ok_or_else(|| {
            Error::InvalidConfig("config cannot be empty in order to create a container".to_string())
        })?;
        let warnings = verify_host_config(&mut host_config)?;
        verify_networking_config(&networking_config)?;

        let image = if config.image.is_empty() {
            None
        } else {
            Some(self.collaborators.images.get_image(&config.image).await?)
        };
        merge_image_defaults(&mut config, image.as_ref().map(|i| &i.config))?;

        let id = self.generate_id()?;
        let name = self.resolve_name(name, &id)?;
        let root = self.config.containers_dir().join(&id);
        let image_id = image.as_ref().map(|i| i.id.clone()).unwrap_or_default();
        let container = Container::new(&id, name, root, config, host_config, image_id);

        let handle = self.store.add(container)?;
        let mut container = handle.lock().await;
        let chain_id = image.as_ref().map(|i| i.chain_id.as_str()).unwrap_or_default();
        if let Err(e) = self.provision(&mut container, chain_id, &networking_config).await {
            error!(container = %id, error = %e, "create failed, removing container");
            self.rollback_create(&mut container).await;
            return Err(e);
        }

        handle.publish(&container);
        self.events.log(&container, "create", &[]);
        info!(container = %container.short_id(), name = %container.name, "container created");
        Ok(CreateResponse { id, warnings })
    }

    /// Provisioning steps that run after registration.
    async fn provision(
        &self,
        container: &mut Container,
        chain_id: &str,
        networking: &NetworkingConfig,
    ) -> Result<()> {
        self.create_metadata_dir(&container.root)?;

        let security_opt = if container.host_config.ipc_mode == "host"
            || container.host_config.pid_mode == "host"
        {
            vec![LABEL_DISABLE.to_string()]
        } else {
            container.host_config.security_opt.clone()
        };
        let labels = self.collaborators.labels.init_labels(&security_opt)?;
        container.process_label = labels.process_label;
        container.mount_label = labels.mount_label;

        self.register_mount_points(container).await?;
        self.register_links(container)?;

        let init = |init_root: &Path| self.platform.setup_init_layer(init_root);
        let layer = self
            .collaborators
            .layers
            .create_rw_layer(&container.id, chain_id, &container.mount_label, &init)
            .await?;
        container.rw_layer = Some(layer);

        let mode = if container.host_config.network_mode.is_empty() {
            self.config.default_network_mode.as_str()
        } else {
            container.host_config.network_mode.as_str()
        };
        container.network_settings = NetworkSettings::placeholder(mode, networking);

        container.to_disk()
    }

    /// Creates the metadata directory, owned by the configured root user.
    fn create_metadata_dir(&self, root: &Path) -> Result<()> {
        create_private_dir(root)?;
        // Only a privileged daemon can hand the directory to another user.
        // SAFETY: geteuid has no preconditions.
        let euid = unsafe { libc::geteuid() };
        if euid == 0 && (self.config.root_uid != 0 || self.config.root_gid != 0) {
            std::os::unix::fs::chown(root, Some(self.config.root_uid), Some(self.config.root_gid))?;
        }
        Ok(())
    }

    /// Resolves binds and anonymous volumes into mount points.
    ///
    /// Each mount point is recorded as soon as its volume reference is
    /// taken, so a later failure releases everything taken so far.
    async fn register_mount_points(&self, container: &mut Container) -> Result<()> {
        for bind in container.host_config.binds.clone() {
            let (source, destination, read_write) = parse_bind(&bind)?;
            if container.mount_points.contains_key(&destination) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate mount point: {}",
                    destination
                )));
            }
            let mount = if source.starts_with('/') {
                MountPoint {
                    source: source.into(),
                    destination: destination.clone(),
                    read_write,
                    volume: None,
                    anonymous: false,
                }
            } else {
                let volume = self
                    .collaborators
                    .volumes
                    .create_with_ref(Some(&source), DEFAULT_VOLUME_DRIVER, &container.id)
                    .await
                    .map_err(|e| Error::Volume(format!("{}: {}", source, e)))?;
                MountPoint {
                    source: volume.mountpoint,
                    destination: destination.clone(),
                    read_write,
                    volume: Some(volume.name),
                    anonymous: false,
                }
            };
            container.mount_points.insert(destination, mount);
        }

        for destination in container.config.volumes.clone() {
            // An explicit bind wins over an anonymous volume.
            if container.mount_points.contains_key(&destination) {
                continue;
            }
            let volume = self
                .collaborators
                .volumes
                .create_with_ref(None, DEFAULT_VOLUME_DRIVER, &container.id)
                .await
                .map_err(|e| Error::Volume(format!("{}: {}", destination, e)))?;
            debug!(container = %container.id, volume = %volume.name, %destination, "anonymous volume");
            container.mount_points.insert(
                destination.clone(),
                MountPoint {
                    source: volume.mountpoint,
                    destination,
                    read_write: true,
                    volume: Some(volume.name),
                    anonymous: true,
                },
            );
        }
        Ok(())
    }

    fn register_links(&self, container: &mut Container) -> Result<()> {
        for link in &container.host_config.links {
            let (name, alias) = link.split_once(':').unwrap_or((link.as_str(), link.as_str()));
            let target = self
                .store
                .get(name)
                .map_err(|_| Error::InvalidConfig(format!("could not get container for {}", name)))?;
            if target.id() == container.id {
                return Err(Error::InvalidConfig(format!(
                    "container cannot link to itself: {}",
                    name
                )));
            }
            container.links.push(Link {
                container_id: target.id().to_string(),
                alias: alias.trim_start_matches('/').to_string(),
            });
        }
        Ok(())
    }

    /// Undoes a partial create. Errors are logged, never returned.
    async fn rollback_create(&self, container: &mut Container) {
        for (step, e) in self.release_resources(container, true).await {
            error!(container = %container.id, step, error = %e, "rollback step failed");
        }
        self.store.remove(&container.id);
        self.client.forget(&container.id);
    }

    fn generate_id(&self) -> Result<String> {
        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let id = hex::encode(Sha256::digest(Uuid::new_v4().as_bytes()));
            // A numeric short ID would be mistaken for a PID or an index.
            if id[..SHORT_ID_LEN].bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            if self.store.get_by_id(&id).is_none() {
                return Ok(id);
            }
        }
        Err(Error::Internal(
            "failed to generate a unique container ID".to_string(),
        ))
    }

    fn resolve_name(&self, requested: Option<String>, id: &str) -> Result<String> {
        let Some(requested) = requested.filter(|n| !n.is_empty()) else {
            return self.generate_name(id);
        };
        validate_container_name(&requested).map_err(|reason| Error::InvalidName {
            name: requested.clone(),
            reason: reason.to_string(),
        })?;
        let name = requested.trim_start_matches('/').to_string();
        if let Some(owner) = self.store.id_for_name(&name) {
            return Err(Error::NameConflict { name, id: owner });
        }
        Ok(name)
    }

    fn generate_name(&self, id: &str) -> Result<String> {
        let seed = u64::from_str_radix(&id[..SHORT_ID_LEN.min(16)], 16).unwrap_or_default();
        let base = format!(
            "{}_{}",
            NAME_ADJECTIVES[(seed % NAME_ADJECTIVES.len() as u64) as usize],
            NAME_NOUNS[((seed >> 16) % NAME_NOUNS.len() as u64) as usize]
        );
        for attempt in 0..MAX_GENERATE_ATTEMPTS {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}{}", base, attempt)
            };
            if self.store.id_for_name(&name).is_none() {
                return Ok(name);
            }
        }
        Ok(format!("{}_{}", base, &id[..SHORT_ID_LEN]))
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Checks host settings. Out-of-range CPU shares are clamped with a warning.
fn verify_host_config(host: &mut HostConfig) -> Result<Vec<String>> {
    let mut warnings = Vec::new();

    if host.memory < 0 {
        return Err(Error::InvalidConfig(format!(
            "invalid memory limit: {}",
            host.memory
        )));
    }
    if host.memory > 0 && host.memory < MIN_MEMORY_LIMIT {
        return Err(Error::InvalidConfig(
            "minimum memory limit allowed is 4MB".to_string(),
        ));
    }
    if let Some(total) = host_memory()
        && host.memory > total
    {
        return Err(Error::InvalidConfig(format!(
            "memory limit {} exceeds host memory {}",
            host.memory, total
        )));
    }

    if host.cpu_shares < 0 {
        return Err(Error::InvalidConfig(format!(
            "invalid CPU shares: {}",
            host.cpu_shares
        )));
    }
    if host.cpu_shares > 0 && host.cpu_shares < MIN_CPU_SHARES {
        warnings.push(format!(
            "CPU shares {} below minimum, raised to {}",
            host.cpu_shares, MIN_CPU_SHARES
        ));
        host.cpu_shares = MIN_CPU_SHARES;
    } else if host.cpu_shares > MAX_CPU_SHARES {
        warnings.push(format!(
            "CPU shares {} above maximum, lowered to {}",
            host.cpu_shares, MAX_CPU_SHARES
        ));
        host.cpu_shares = MAX_CPU_SHARES;
    }

    if host.pids_limit < 0 {
        return Err(Error::InvalidConfig(format!(
            "invalid PIDs limit: {}",
            host.pids_limit
        )));
    }

    if !matches!(host.ipc_mode.as_str(), "" | "private" | "shareable" | "host") {
        return Err(Error::InvalidConfig(format!(
            "invalid IPC mode: {}",
            host.ipc_mode
        )));
    }
    if !matches!(host.pid_mode.as_str(), "" | "host") {
        return Err(Error::InvalidConfig(format!(
            "invalid PID mode: {}",
            host.pid_mode
        )));
    }
    if host.network_mode.starts_with("container:") && connected_container(&host.network_mode).is_none() {
        return Err(Error::InvalidConfig(
            "network mode container: requires a container name".to_string(),
        ));
    }
    if !host.restart_policy.is_none() && host.network_mode.starts_with("container:") {
        warnings.push(format!(
            "restart policy {} follows the lifetime of the network peer",
            host.restart_policy
        ));
    }
    Ok(warnings)
}

/// At most one endpoint can be requested at create time.
fn verify_networking_config(networking: &NetworkingConfig) -> Result<()> {
    if networking.endpoints.len() > 1 {
        let names: Vec<&str> = networking.endpoints.keys().map(String::as_str).collect();
        return Err(Error::InvalidConfig(format!(
            "container cannot be connected to network endpoints: {}",
            names.join(", ")
        )));
    }
    Ok(())
}

/// Fills unset fields from the image. A container needs a command from
/// one of the two.
fn merge_image_defaults(config: &mut ContainerConfig, image: Option<&ImageConfig>) -> Result<()> {
    if let Some(image) = image {
        if config.entrypoint.is_empty() {
            config.entrypoint = image.entrypoint.clone();
            if config.cmd.is_empty() {
                config.cmd = image.cmd.clone();
            }
        }
        let mut env: Vec<String> = image
            .env
            .iter()
            .filter(|entry| {
                let key = entry.split_once('=').map_or(entry.as_str(), |(k, _)| k);
                !config
                    .env
                    .iter()
                    .any(|own| own.split_once('=').map_or(own.as_str(), |(k, _)| k) == key)
            })
            .cloned()
            .collect();
        env.append(&mut config.env);
        config.env = env;

        if config.working_dir.is_empty() {
            config.working_dir = image.working_dir.clone();
        }
        if config.user.is_empty() {
            config.user = image.user.clone();
        }
        config.volumes.extend(image.volumes.iter().cloned());
    }

    if config.entrypoint.is_empty() && config.cmd.is_empty() {
        return Err(Error::InvalidConfig("no command specified".to_string()));
    }
    Ok(())
}

/// Parses `source:destination[:ro|rw]`.
fn parse_bind(bind: &str) -> Result<(String, String, bool)> {
    let parts: Vec<&str> = bind.split(':').collect();
    let (source, destination, read_write) = match parts.as_slice() {
        [source, destination] => (*source, *destination, true),
        [source, destination, "rw"] => (*source, *destination, true),
        [source, destination, "ro"] => (*source, *destination, false),
        _ => {
            return Err(Error::InvalidConfig(format!(
                "invalid bind specification: {}",
                bind
            )));
        }
    };
    if source.is_empty() || !destination.starts_with('/') {
        return Err(Error::InvalidConfig(format!(
            "invalid bind specification: {}",
            bind
        )));
    }
    Ok((source.to_string(), destination.to_string(), read_write))
}

/// Total physical memory in bytes.
fn host_memory() -> Option<i64> {
    // SAFETY: sysconf has no preconditions.
    let (pages, page_size) =
        unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
    if pages <= 0 || page_size <= 0 {
        return None;
    }
    Some((pages as i64).saturating_mul(page_size as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind() {
        assert_eq!(
            parse_bind("/host:/data:ro").unwrap(),
            ("/host".to_string(), "/data".to_string(), false)
        );
        assert_eq!(
            parse_bind("cache:/var/cache").unwrap(),
            ("cache".to_string(), "/var/cache".to_string(), true)
        );
        assert!(parse_bind("/host:relative").is_err());
        assert!(parse_bind("/a:/b:/c:ro").is_err());
    }

    #[test]
    fn test_verify_host_config() {
        let mut host = HostConfig {
            memory: 1024,
            ..HostConfig::default()
        };
        assert!(verify_host_config(&mut host).is_err());

        let mut host = HostConfig {
            cpu_shares: 1,
            ..HostConfig::default()
        };
        let warnings = verify_host_config(&mut host).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(host.cpu_shares, MIN_CPU_SHARES);

        let mut host = HostConfig {
            ipc_mode: "bogus".to_string(),
            ..HostConfig::default()
        };
        assert!(verify_host_config(&mut host).is_err());
    }

    #[test]
    fn test_merge_image_defaults() {
        let image = ImageConfig {
            cmd: vec!["sh".to_string()],
            env: vec!["PATH=/bin".to_string(), "LANG=C".to_string()],
            working_dir: "/app".to_string(),
            volumes: vec!["/data".to_string()],
            ..ImageConfig::default()
        };
        let mut config = ContainerConfig {
            env: vec!["LANG=en_US".to_string()],
            ..ContainerConfig::default()
        };
        merge_image_defaults(&mut config, Some(&image)).unwrap();
        assert_eq!(config.cmd, vec!["sh"]);
        assert_eq!(config.env, vec!["PATH=/bin", "LANG=en_US"]);
        assert_eq!(config.working_dir, "/app");
        assert!(config.volumes.contains("/data"));

        let mut empty = ContainerConfig::default();
        assert!(merge_image_defaults(&mut empty, None).is_err());
    }

    #[test]
    fn test_entrypoint_suppresses_image_cmd() {
        let image = ImageConfig {
            cmd: vec!["--help".to_string()],
            ..ImageConfig::default()
        };
        let mut config = ContainerConfig {
            entrypoint: vec!["/bin/app".to_string()],
            ..ContainerConfig::default()
        };
        merge_image_defaults(&mut config, Some(&image)).unwrap();
        assert!(config.cmd.is_empty());
    }
}
