//! Restart policy evaluation.
//!
//! A [`RestartManager`] is attached to a container on its first start and
//! survives automatic restarts. Each exit of the init process is fed to
//! [`RestartManager::should_restart`], which either declines or returns a
//! [`RestartWait`] that resolves once the backoff delay has elapsed.
//!
//! ```text
//!   exit ──► should_restart ──► Stop
//!                 │
//!                 └──► Restart { delay, wait }
//!                                 │
//!                    ┌────────────┴────────────┐
//!                 elapsed                   cancel()
//!                    │                         │
//!                 Ok(())               Err(RestartError::Canceled)
//! ```
//!
//! Cancellation is permanent: once [`RestartManager::cancel`] has been
//! called every later evaluation fails with [`RestartError::Canceled`].

use crate::constants::{
    RESTART_BACKOFF_BASE, RESTART_BACKOFF_MAX, RESTART_BACKOFF_MULTIPLIER, RESTART_RESET_UPTIME,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Policy
// =============================================================================

/// Restart policy requested in a container's host config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Never restart.
    #[default]
    No,
    /// Restart on non-zero exit, at most `max_retries` times (0 = unlimited).
    OnFailure {
        #[serde(default)]
        max_retries: u32,
    },
    /// Always restart.
    Always,
    /// Restart unless the operator stopped the container.
    UnlessStopped,
}

impl RestartPolicy {
    /// Parses `no`, `always`, `unless-stopped`, `on-failure` or `on-failure:N`.
    pub fn parse(s: &str) -> Result<Self, String> {
        let (name, count) = match s.split_once(':') {
            Some((name, count)) => (name, Some(count)),
            None => (s, None),
        };
        let policy = match name {
            "" | "no" => Self::No,
            "always" => Self::Always,
            "unless-stopped" => Self::UnlessStopped,
            "on-failure" => {
                let max_retries = match count {
                    Some(n) => n
                        .parse::<u32>()
                        .map_err(|_| format!("maximum retry count must be an integer: {n}"))?,
                    None => 0,
                };
                return Ok(Self::OnFailure { max_retries });
            }
            other => return Err(format!("invalid restart policy '{other}'")),
        };
        if count.is_some() {
            return Err(format!(
                "maximum retry count cannot be used with restart policy '{name}'"
            ));
        }
        Ok(policy)
    }

    /// Returns true for the `no` policy.
    pub fn is_none(&self) -> bool {
        matches!(self, Self::No)
    }

    /// Returns true when the daemon should start this container on boot,
    /// given whether the operator stopped it.
    pub fn restarts_on_boot(&self, manually_stopped: bool) -> bool {
        match self {
            Self::Always => true,
            Self::UnlessStopped => !manually_stopped,
            _ => false,
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::No => write!(f, "no"),
            Self::OnFailure { max_retries: 0 } => write!(f, "on-failure"),
            Self::OnFailure { max_retries } => write!(f, "on-failure:{}", max_retries),
            Self::Always => write!(f, "always"),
            Self::UnlessStopped => write!(f, "unless-stopped"),
        }
    }
}

// =============================================================================
// Errors and Decisions
// =============================================================================

/// Restart manager refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RestartError {
    /// The manager was cancelled by an explicit stop.
    #[error("restart canceled")]
    Canceled,
    /// A previous restart wait has not resolved yet.
    #[error("invalid call on an active restart manager")]
    Active,
}

/// Outcome of evaluating one exit.
#[derive(Debug)]
pub enum RestartDecision {
    /// Leave the container stopped.
    Stop,
    /// Start the container again after `delay`.
    Restart { delay: Duration, wait: RestartWait },
}

impl RestartDecision {
    /// Returns true if the decision is to restart.
    pub fn is_restart(&self) -> bool {
        matches!(self, Self::Restart { .. })
    }
}

/// Pending backoff delay. Resolves to `Ok(())` when the delay elapses or
/// to [`RestartError::Canceled`] when the manager is cancelled first.
#[derive(Debug)]
pub struct RestartWait {
    rx: oneshot::Receiver<Result<(), RestartError>>,
}

impl RestartWait {
    /// Waits for the backoff to finish.
    pub async fn wait(self) -> Result<(), RestartError> {
        self.rx.await.unwrap_or(Err(RestartError::Canceled))
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Debug)]
struct ManagerState {
    restart_count: u32,
    timeout: Duration,
    active: bool,
    canceled: bool,
}

/// Per-container restart policy state.
#[derive(Debug)]
pub struct RestartManager {
    policy: RestartPolicy,
    state: Arc<Mutex<ManagerState>>,
    cancel: CancellationToken,
}

impl RestartManager {
    /// Creates a manager that has already restarted `restart_count` times.
    pub fn new(policy: RestartPolicy, restart_count: u32) -> Self {
        Self {
            policy,
            state: Arc::new(Mutex::new(ManagerState {
                restart_count,
                timeout: Duration::ZERO,
                active: false,
                canceled: false,
            })),
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the policy this manager enforces.
    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Number of restarts granted so far.
    pub fn restart_count(&self) -> u32 {
        self.lock().restart_count
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_canceled(&self) -> bool {
        self.lock().canceled
    }

    /// Evaluates one exit of the init process.
    ///
    /// Must be called from within a tokio runtime; a restart decision spawns
    /// the timer task backing the returned [`RestartWait`].
    pub fn should_restart(
        &self,
        exit_code: u32,
        manually_stopped: bool,
        uptime: Duration,
    ) -> Result<RestartDecision, RestartError> {
        if self.policy.is_none() {
            return Ok(RestartDecision::Stop);
        }

        let delay = {
            let mut state = self.lock();
            if state.canceled {
                return Err(RestartError::Canceled);
            }
            if state.active {
                return Err(RestartError::Active);
            }
            if manually_stopped {
                return Ok(RestartDecision::Stop);
            }

            let restart = match &self.policy {
                RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
                RestartPolicy::OnFailure { max_retries } => {
                    exit_code != 0 && (*max_retries == 0 || state.restart_count < *max_retries)
                }
                RestartPolicy::No => false,
            };
            if !restart {
                return Ok(RestartDecision::Stop);
            }

            if uptime >= RESTART_RESET_UPTIME {
                state.timeout = Duration::ZERO;
            }
            state.timeout = if state.timeout.is_zero() {
                RESTART_BACKOFF_BASE
            } else {
                (state.timeout * RESTART_BACKOFF_MULTIPLIER).min(RESTART_BACKOFF_MAX)
            };
            state.restart_count += 1;
            state.active = true;
            state.timeout
        };

        debug!(
            policy = %self.policy,
            delay_ms = delay.as_millis() as u64,
            "restart scheduled"
        );

        let (tx, rx) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(RestartError::Canceled),
                _ = tokio::time::sleep(delay) => Ok(()),
            };
            if let Ok(mut state) = state.lock() {
                state.active = false;
            }
            let _ = tx.send(outcome);
        });

        Ok(RestartDecision::Restart {
            delay,
            wait: RestartWait { rx },
        })
    }

    /// Cancels any pending wait and refuses all future restarts.
    pub fn cancel(&self) {
        self.lock().canceled = true;
        self.cancel.cancel();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        // A panic while holding this lock leaves plain counters behind.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
