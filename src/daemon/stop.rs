//! Stop, pause and unpause.

use super::store::StatusSnapshot;
use super::{ContainerHandle, Daemon, persist};
use crate::constants::{DEFAULT_STOP_TIMEOUT, INIT_PROCESS_ID, KILL_WAIT_TIMEOUT};
use crate::container::RunState;
use crate::error::{Error, Result};
use crate::runtime::Signal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of a stop request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The container was not alive. Nothing was changed.
    AlreadyStopped,
}

impl Daemon {
    /// Stops a container: SIGTERM, then SIGKILL once `timeout` (default
    /// 10s) has passed. Returns after the exit has been reconciled.
    ///
    /// The container is marked manually stopped, so `unless-stopped` does
    /// not bring it back on the next boot.
    pub async fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<StopOutcome> {
        let handle = self.store.get(name)?;
        let grace = timeout.unwrap_or(DEFAULT_STOP_TIMEOUT);
        let outcome = self.stop_container(&handle, Some(grace), true).await?;
        if outcome == StopOutcome::Stopped {
            info!(container = %handle.id(), "container stopped");
        }
        Ok(outcome)
    }

    /// Halts a container and waits for the exit to be applied.
    ///
    /// With a `grace` period the init process gets SIGTERM first; without
    /// one it is killed right away. Any pending restart is cancelled either
    /// way.
    pub(crate) async fn stop_container(
        &self,
        handle: &Arc<ContainerHandle>,
        grace: Option<Duration>,
        manual: bool,
    ) -> Result<StopOutcome> {
        let mut status = handle.subscribe_status();
        let (id, restarting, paused) = {
            let mut container = handle.lock().await;
            if !container.state.status.is_alive() {
                return Ok(StopOutcome::AlreadyStopped);
            }
            if manual {
                container.has_been_manually_stopped = true;
                persist(&container);
            }
            if let Some(rm) = container.current_restart_manager() {
                rm.cancel();
            }
            (
                container.id.clone(),
                container.state.is_restarting(),
                container.state.is_paused(),
            )
        };

        if restarting {
            // The cancelled restart wait finalizes the exit on its own,
            // unless the backoff elapsed first and the container is back up.
            debug!(container = %id, "cancelled pending restart");
            let settled = status.wait_for(|s| s.status != RunState::Restarting);
            if tokio::time::timeout(KILL_WAIT_TIMEOUT, settled).await.is_err() {
                return Err(Error::Timeout {
                    operation: "stop restarting container".to_string(),
                    duration: KILL_WAIT_TIMEOUT,
                });
            }
            if !handle.status().status.is_alive() {
                return Ok(StopOutcome::Stopped);
            }
        }

        if paused && let Err(e) = self.client.resume(&id).await {
            warn!(container = %id, error = %e, "failed to resume paused container before stop");
        }

        if let Some(grace) = grace {
            self.send_signal(&id, Signal::Term).await;
            if wait_for_exit(&mut status, grace).await {
                return Ok(StopOutcome::Stopped);
            }
            info!(
                container = %id,
                grace_secs = grace.as_secs(),
                "container did not exit in time, killing"
            );
        }

        self.send_signal(&id, Signal::Kill).await;
        wait_or_timeout(&mut status, KILL_WAIT_TIMEOUT, "kill container").await
    }

    /// Signals the init process. A container that already left the backend
    /// is not an error: its exit is on the way.
    async fn send_signal(&self, id: &str, signal: Signal) {
        if let Err(e) = self.client.signal(id, INIT_PROCESS_ID, signal).await {
            debug!(container = %id, %signal, error = %e, "signal not delivered");
        }
    }

    // =========================================================================
    // Pause / Unpause
    // =========================================================================

    /// Freezes a running container. The state flips when the backend
    /// confirms.
    pub async fn pause(&self, name: &str) -> Result<()> {
        let handle = self.store.get(name)?;
        let container = handle.lock().await;
        if container.state.status != RunState::Running {
            return Err(Error::InvalidState {
                id: container.id.clone(),
                state: container.state.status.to_string(),
                expected: "running".to_string(),
            });
        }
        self.client.pause(&container.id).await
    }

    /// Thaws a paused container.
    pub async fn unpause(&self, name: &str) -> Result<()> {
        let handle = self.store.get(name)?;
        let container = handle.lock().await;
        if !container.state.is_paused() {
            return Err(Error::InvalidState {
                id: container.id.clone(),
                state: container.state.status.to_string(),
                expected: "paused".to_string(),
            });
        }
        self.client.resume(&container.id).await
    }
}

/// Waits until the published status is no longer alive.
async fn wait_for_exit(status: &mut watch::Receiver<StatusSnapshot>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, status.wait_for(|s| !s.status.is_alive())).await {
        Ok(Ok(_)) => true,
        _ => false,
    }
}

async fn wait_or_timeout(
    status: &mut watch::Receiver<StatusSnapshot>,
    limit: Duration,
    operation: &str,
) -> Result<StopOutcome> {
    if wait_for_exit(status, limit).await {
        Ok(StopOutcome::Stopped)
    } else {
        Err(Error::Timeout {
            operation: operation.to_string(),
            duration: limit,
        })
    }
}
