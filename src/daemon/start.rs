//! Container start and cleanup.

use super::{ContainerHandle, Daemon, persist};
use crate::container::{
    Container, EndpointConfig, EndpointSettings, NetworkSettings, RunState, connected_container,
    is_attachable_mode,
};
use crate::daemon::collaborators::AttachRequest;
use crate::error::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Result of a start request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// The container was already running or about to be restarted. Nothing
    /// was changed.
    AlreadyRunning,
}

impl Daemon {
    /// Starts a created or exited container.
    ///
    /// # Errors
    ///
    /// - [`Error::StartPaused`] for a paused container
    /// - [`Error::RemovalInProgress`] / [`Error::ContainerDead`] for a
    ///   container on its way out
    /// - any provisioning or backend error, after the container has been
    ///   cleaned up and its failure recorded
    pub async fn start(&self, name: &str) -> Result<StartOutcome> {
        let handle = self.store.get(name)?;
        let mut container = handle.lock().await;

        if container.state.is_paused() {
            return Err(Error::StartPaused(container.id.clone()));
        }
        if container.state.is_running() || container.state.is_restarting() {
            debug!(container = %container.id, "container already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        if container.state.removal_in_progress {
            return Err(Error::RemovalInProgress(container.id.clone()));
        }
        if container.state.is_dead() {
            return Err(Error::ContainerDead(container.id.clone()));
        }

        match self.start_locked(&handle, &mut container).await {
            Ok(()) => Ok(StartOutcome::Started),
            Err(e) => {
                warn!(container = %container.id, error = %e, "failed to start container");
                self.fail_start(&handle, &mut container, &e).await;
                Err(e)
            }
        }
    }

    async fn start_locked(&self, handle: &ContainerHandle, container: &mut Container) -> Result<()> {
        if self.platform.mounts_rootfs() {
            self.mount(container).await?;
        }
        if container.host_config.network_mode.is_empty() {
            container.host_config.network_mode = self.config.default_network_mode.clone();
        }
        self.initialize_networking(container).await?;
        self.platform.setup_ipc_mounts(container).await?;

        let spec = self.platform.create_spec(container)?;
        let restart_manager = container.restart_manager(true);
        let pid = self
            .client
            .start(&container.id, spec, Some(restart_manager))
            .await
            .map_err(|e| e.classify_start(&container.path))?;

        container.has_been_manually_stopped = false;
        container.state.set_running(pid, Utc::now());
        persist(container);
        handle.publish(container);
        info!(container = %container.short_id(), pid, "container running");
        Ok(())
    }

    /// Records a start failure and tears down whatever was set up.
    async fn fail_start(&self, handle: &ContainerHandle, container: &mut Container, e: &Error) {
        container.state.set_start_error(e.to_string(), e.exit_code());
        persist(container);
        self.cleanup(handle, container).await;
        handle.publish(container);

        self.events.log(container, "start", &[]);
        self.events.log(
            container,
            "die",
            &[("exitCode", container.state.exit_code.to_string())],
        );
    }

    async fn mount(&self, container: &mut Container) -> Result<()> {
        if container.base_fs.is_some() {
            return Ok(());
        }
        let layer = container.rw_layer.clone().ok_or_else(|| {
            Error::Storage(format!("container {} has no writable layer", container.id))
        })?;
        let base_fs = self
            .collaborators
            .layers
            .mount(&layer, &container.mount_label)
            .await?;
        debug!(container = %container.id, path = %base_fs.display(), "mounted rootfs");
        container.base_fs = Some(base_fs);
        Ok(())
    }

    async fn initialize_networking(&self, container: &mut Container) -> Result<()> {
        let mode = container.host_config.network_mode.clone();

        if let Some(peer) = connected_container(&mode) {
            let peer = self.store.get(peer)?;
            if peer.id() == container.id {
                return Err(Error::InvalidConfig(
                    "cannot join own network namespace".to_string(),
                ));
            }
            let status = peer.status();
            if !matches!(status.status, RunState::Running | RunState::Paused) {
                return Err(Error::InvalidState {
                    id: peer.id().to_string(),
                    state: status.status.to_string(),
                    expected: "running".to_string(),
                });
            }
            container.network_settings = NetworkSettings {
                sandbox_key: Some(format!("/proc/{}/ns/net", status.pid)),
                networks: BTreeMap::new(),
            };
            return Ok(());
        }

        if !is_attachable_mode(&mode) {
            return Ok(());
        }

        let hostname = if container.config.hostname.is_empty() {
            container.short_id().to_string()
        } else {
            container.config.hostname.clone()
        };
        let endpoints = container
            .network_settings
            .networks
            .iter()
            .map(|(name, endpoint)| {
                let config = EndpointConfig {
                    aliases: endpoint.aliases.clone(),
                    ip_address: Some(endpoint.ip_address.clone()).filter(|ip| !ip.is_empty()),
                };
                (name.clone(), config)
            })
            .collect();
        let request = AttachRequest {
            container_id: container.id.clone(),
            name: container.name.clone(),
            hostname,
            network_mode: mode,
            endpoints,
        };
        container.network_settings = self.collaborators.network.attach(&request).await?;
        Ok(())
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Releases everything a run of the container acquired.
    ///
    /// Every step runs even if an earlier one failed; failures are logged.
    /// Running it twice is harmless.
    pub(crate) async fn cleanup(&self, handle: &ContainerHandle, container: &mut Container) {
        let id = container.id.clone();
        self.release_network(container).await;

        if let Err(e) = self.platform.unmount_ipc_mounts(container).await {
            warn!(container = %id, error = %e, "failed to unmount IPC mounts");
        }

        if container.base_fs.is_some()
            && let Some(layer) = container.rw_layer.clone()
            && let Err(e) = self.collaborators.layers.unmount(&layer).await
        {
            warn!(container = %id, error = %e, "failed to unmount rootfs, forcing");
            match self.collaborators.layers.get_mount_id(&id).await {
                Ok(mount_id) => {
                    if let Err(e) = self.platform.cleanup_mounts_by_id(&mount_id).await {
                        warn!(container = %id, error = %e, "forced unmount failed");
                    }
                }
                Err(e) => warn!(container = %id, error = %e, "failed to get mount ID"),
            }
        }

        let execs = std::mem::take(&mut container.exec_commands);
        if !execs.is_empty() {
            let mut registry = self.execs();
            for exec_id in &execs {
                registry.remove(exec_id);
            }
        }

        if container.base_fs.is_some()
            && let Err(e) = self.platform.unmount_volumes(container).await
        {
            warn!(container = %id, error = %e, "failed to unmount volumes");
        }
        container.base_fs = None;

        handle.cancel_attach();
        debug!(container = %id, "cleanup complete");
    }

    async fn release_network(&self, container: &mut Container) {
        let mode = container.host_config.network_mode.as_str();
        if connected_container(mode).is_some() {
            container.network_settings.sandbox_key = None;
            return;
        }
        if !is_attachable_mode(mode) || !container.network_settings.is_attached() {
            return;
        }

        if let Err(e) = self.collaborators.network.release(&container.id).await {
            warn!(container = %container.id, error = %e, "failed to release network");
        }
        // Keep the requested networks so the next start attaches again.
        container.network_settings.sandbox_key = None;
        for endpoint in container.network_settings.networks.values_mut() {
            *endpoint = EndpointSettings {
                aliases: std::mem::take(&mut endpoint.aliases),
                ..EndpointSettings::default()
            };
        }
    }
}
