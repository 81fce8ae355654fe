//! Container removal.

use super::Daemon;
use crate::container::Container;
use crate::error::{Error, Result};
use tracing::{info, warn};

/// Options of a remove request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveOptions {
    /// Kill an alive container instead of refusing.
    pub force: bool,
    /// Also delete anonymous volumes.
    pub remove_volumes: bool,
}

impl Daemon {
    /// Removes a container and everything it owns.
    ///
    /// # Errors
    ///
    /// - [`Error::RemovalInProgress`] if another removal is running
    /// - [`Error::ContainerRunning`] for an alive container without `force`
    pub async fn remove(&self, name: &str, options: RemoveOptions) -> Result<()> {
        let handle = self.store.get(name)?;
        {
            let mut container = handle.lock().await;
            if container.state.removal_in_progress {
                return Err(Error::RemovalInProgress(container.id.clone()));
            }
            if container.state.status.is_alive() && !options.force {
                return Err(Error::ContainerRunning(container.id.clone()));
            }
            container.state.removal_in_progress = true;
        }

        if handle.status().status.is_alive()
            && let Err(e) = self.stop_container(&handle, None, true).await
        {
            handle.lock().await.state.removal_in_progress = false;
            return Err(e);
        }

        let mut container = handle.lock().await;
        self.cleanup(&handle, &mut container).await;
        for (step, e) in self
            .release_resources(&mut container, options.remove_volumes)
            .await
        {
            warn!(container = %container.id, step, error = %e, "removal step failed");
        }
        container.state.set_dead();
        handle.publish(&container);

        self.store.remove(&container.id);
        self.client.forget(&container.id);
        self.events.log(&container, "destroy", &[]);
        info!(container = %container.short_id(), name = %container.name, "container removed");
        Ok(())
    }

    /// Releases what create acquired: writable layer, labels, volume
    /// references and the metadata directory.
    ///
    /// Returns the failed steps instead of stopping at the first one.
    pub(crate) async fn release_resources(
        &self,
        container: &mut Container,
        remove_volumes: bool,
    ) -> Vec<(&'static str, Error)> {
        let mut failures = Vec::new();

        if let Some(layer) = container.rw_layer.take()
            && let Err(e) = self.collaborators.layers.release_rw_layer(&layer).await
        {
            failures.push(("release writable layer", e));
        }

        if !container.mount_label.is_empty() {
            self.collaborators.labels.release_labels(&container.mount_label);
        }

        for mount in std::mem::take(&mut container.mount_points).into_values() {
            let Some(volume) = mount.volume else {
                continue;
            };
            if let Err(e) = self
                .collaborators
                .volumes
                .dereference(&volume, &container.id)
                .await
            {
                failures.push(("dereference volume", e));
                continue;
            }
            if remove_volumes
                && mount.anonymous
                && let Err(e) = self.collaborators.volumes.remove(&volume).await
            {
                failures.push(("remove volume", e));
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&container.root)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            failures.push(("remove metadata directory", e.into()));
        }

        failures
    }
}
