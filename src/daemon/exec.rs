//! Auxiliary processes ("exec") in running containers.

use super::Daemon;
use crate::container::{ExecConfig, RunState};
use crate::error::{Error, Result};
use crate::runtime::ProcessSpec;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Parameters of an exec instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub cmd: Vec<String>,
    /// `KEY=value` entries added to the container's environment.
    pub env: Vec<String>,
    /// Overrides the container user when set.
    pub user: String,
    /// Overrides the container working directory when set.
    pub working_dir: String,
    pub tty: bool,
}

impl Daemon {
    /// Registers an exec instance on a running container and returns its
    /// ID. Nothing runs until [`exec_start`](Self::exec_start).
    pub async fn exec_create(&self, name: &str, options: ExecOptions) -> Result<String> {
        if options.cmd.is_empty() {
            return Err(Error::InvalidConfig("no exec command specified".to_string()));
        }
        let handle = self.store.get(name)?;
        let mut container = handle.lock().await;
        ensure_running(&container.id, container.state.status)?;

        let exec_id = hex::encode(Sha256::digest(Uuid::new_v4().as_bytes()));
        let exec = ExecConfig {
            id: exec_id.clone(),
            container_id: container.id.clone(),
            cmd: options.cmd,
            env: options.env,
            user: options.user,
            working_dir: options.working_dir,
            tty: options.tty,
            running: false,
            pid: 0,
            exit_code: None,
        };
        self.execs().insert(exec_id.clone(), exec);
        container.exec_commands.insert(exec_id.clone());

        self.events
            .log(&container, "exec_create", &[("execID", exec_id.clone())]);
        Ok(exec_id)
    }

    /// Launches a registered exec instance and returns its system PID.
    pub async fn exec_start(&self, exec_id: &str) -> Result<u32> {
        let exec = self.exec_inspect(exec_id)?;
        ensure_startable(exec_id, &exec)?;

        let handle = self
            .store
            .get_by_id(&exec.container_id)
            .ok_or_else(|| Error::ContainerNotFound(exec.container_id.clone()))?;
        let container = handle.lock().await;
        ensure_running(&container.id, container.state.status)?;
        // A stop or another start may have landed while waiting for the lock.
        let exec = self.exec_inspect(exec_id)?;
        ensure_startable(exec_id, &exec)?;

        let mut env = container.config.env.clone();
        env.extend(exec.env.iter().cloned());
        let pick = |own: &str, fallback: &str| {
            Some(if own.is_empty() { fallback } else { own })
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let process = ProcessSpec {
            args: exec.cmd.clone(),
            env,
            cwd: pick(&exec.working_dir, &container.config.working_dir),
            user: pick(&exec.user, &container.config.user),
            terminal: exec.tty,
        };

        // The exit cannot be applied before this returns: it needs the
        // container lock held here.
        let pid = self.client.add_process(&container.id, exec_id, process).await?;
        if let Some(exec) = self.execs().get_mut(exec_id) {
            exec.running = true;
            exec.pid = pid;
        }
        debug!(container = %container.id, exec = %exec_id, pid, "exec started");
        self.events.log(
            &container,
            "exec_start",
            &[("execID", exec_id.to_string()), ("pid", pid.to_string())],
        );
        Ok(pid)
    }

    /// Returns a snapshot of an exec instance.
    pub fn exec_inspect(&self, exec_id: &str) -> Result<ExecConfig> {
        self.execs()
            .get(exec_id)
            .cloned()
            .ok_or_else(|| Error::ExecNotFound(exec_id.to_string()))
    }
}

fn ensure_startable(exec_id: &str, exec: &ExecConfig) -> Result<()> {
    if !exec.running && exec.exit_code.is_none() {
        return Ok(());
    }
    Err(Error::InvalidState {
        id: exec_id.to_string(),
        state: if exec.running { "running" } else { "exited" }.to_string(),
        expected: "created".to_string(),
    })
}

fn ensure_running(id: &str, status: RunState) -> Result<()> {
    if status == RunState::Running {
        return Ok(());
    }
    Err(Error::InvalidState {
        id: id.to_string(),
        state: status.to_string(),
        expected: "running".to_string(),
    })
}
