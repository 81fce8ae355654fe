//! Applies reconciled transitions from the runtime client.

use super::{Daemon, persist, streams};
use crate::constants::INIT_PROCESS_ID;
use crate::error::Result;
use crate::runtime::{IoPipes, StateBridge, StateInfo, StateKind};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

#[async_trait]
impl StateBridge for Daemon {
    async fn state_changed(&self, id: &str, info: StateInfo) -> Result<()> {
        let Some(handle) = self.store.get_by_id(id) else {
            debug!(container = %id, state = %info.state, "state change for unregistered container");
            return Ok(());
        };
        let mut container = handle.lock().await;
        let exit_code = info.exit_code as i32;

        match info.state {
            StateKind::Exit => {
                container.state.set_stopped(exit_code, info.oom_killed);
                self.events
                    .log(&container, "die", &[("exitCode", exit_code.to_string())]);
                self.cleanup(&handle, &mut container).await;
                persist(&container);
            }
            StateKind::Restart => {
                container.restart_count += 1;
                container.state.set_restarting(exit_code, info.oom_killed);
                self.events
                    .log(&container, "die", &[("exitCode", exit_code.to_string())]);
                persist(&container);
            }
            StateKind::ExitProcess => {
                let exec_id = info.process_id.unwrap_or_default();
                if let Some(exec) = self.execs().get_mut(&exec_id) {
                    exec.running = false;
                    exec.exit_code = Some(exit_code);
                }
                self.events.log(
                    &container,
                    "exec_die",
                    &[("execID", exec_id), ("exitCode", exit_code.to_string())],
                );
            }
            StateKind::Start => {
                let pid = info.pid.unwrap_or(container.state.pid);
                // An explicit start has already recorded this run.
                if !(container.state.is_running() && container.state.pid == pid) {
                    container.state.set_running(pid, Utc::now());
                }
                container.has_been_manually_stopped = false;
                self.events.log(&container, "start", &[]);
                persist(&container);
            }
            StateKind::Pause => {
                container.state.set_paused(true);
                self.events.log(&container, "pause", &[]);
                persist(&container);
            }
            StateKind::Resume => {
                container.state.set_paused(false);
                self.events.log(&container, "unpause", &[]);
                persist(&container);
            }
            StateKind::Oom => {
                self.events.log(&container, "oom", &[]);
            }
        }

        handle.publish(&container);
        if info.state == StateKind::Exit {
            info!(
                container = %container.short_id(),
                exit_code,
                oom = info.oom_killed,
                "container exited"
            );
        }
        Ok(())
    }

    async fn attach_streams(&self, id: &str, pipes: IoPipes) -> Result<()> {
        let Some(handle) = self.store.get_by_id(id) else {
            debug!(container = %id, "streams for unregistered container");
            return Ok(());
        };
        let log_name = if pipes.process_id == INIT_PROCESS_ID {
            // A new run of the init process replaces the previous copiers.
            handle.cancel_attach();
            format!("{}-json.log", id)
        } else {
            format!("exec-{}-json.log", pipes.process_id)
        };
        let log_path = handle.root().join(log_name);
        streams::attach(&pipes, &log_path, handle.attach_context()).await
    }
}
