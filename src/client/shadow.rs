//! Runtime-side record of a container, its bundle directory and its pipes.

use crate::bundle::{OciSpec, write_bundle};
use crate::constants::{
    INIT_PROCESS_ID, PIPE_BUFFER_SIZE, STDERR_SUFFIX, STDIN_SUFFIX, STDOUT_SUFFIX,
};
use crate::error::{Error, Result};
use crate::restart::RestartManager;
use crate::runtime::IoPipes;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// An auxiliary process of a live container.
#[derive(Debug, Clone)]
pub(crate) struct ProcessShadow {
    pub pid: u32,
    pub pipes: IoPipes,
}

/// A container as the runtime client knows it.
#[derive(Debug)]
pub(crate) struct Shadow {
    pub id: String,
    pub dir: PathBuf,
    pub spec: OciSpec,
    pub pipes: IoPipes,
    pub system_pid: u32,
    /// Sticky until the next exit is reported.
    pub oom: bool,
    pub restart_manager: Option<Arc<RestartManager>>,
    pub restarting: bool,
    pub started_at: Option<Instant>,
    pub processes: HashMap<String, ProcessShadow>,
}

impl Shadow {
    pub fn new(
        id: &str,
        dir: PathBuf,
        spec: OciSpec,
        restart_manager: Option<Arc<RestartManager>>,
    ) -> Self {
        let pipes = pipe_paths(&dir, INIT_PROCESS_ID, spec.process.terminal);
        Self {
            id: id.to_string(),
            dir,
            spec,
            pipes,
            system_pid: 0,
            oom: false,
            restart_manager,
            restarting: false,
            started_at: None,
            processes: HashMap::new(),
        }
    }

    /// Writes the bundle and creates the init pipes.
    pub fn prepare(&self) -> Result<()> {
        write_bundle(&self.dir, &self.spec)?;
        create_fifos(&self.pipes)
    }

    /// Time since the backend confirmed the start.
    pub fn uptime(&self) -> Duration {
        self.started_at.map(|t| t.elapsed()).unwrap_or_default()
    }

    /// Clears per-run state before an automatic restart.
    pub fn reset_for_restart(&mut self) {
        self.system_pid = 0;
        self.oom = false;
        self.restarting = false;
        self.started_at = None;
        self.processes.clear();
    }

    /// Drains unread output and deletes the bundle directory.
    ///
    /// Does nothing when `no_clean` is set, so the bundle can be inspected.
    pub fn clean(&self, no_clean: bool) {
        if no_clean {
            debug!(container = %self.id, dir = %self.dir.display(), "keeping bundle directory");
            return;
        }
        discard_fifos(&self.pipes);
        for process in self.processes.values() {
            discard_fifos(&process.pipes);
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(container = %self.id, dir = %self.dir.display(), error = %e, "failed to remove bundle directory")
            }
        }
    }
}

/// Pipe paths for one process inside a bundle directory.
pub(crate) fn pipe_paths(dir: &Path, process_id: &str, terminal: bool) -> IoPipes {
    let pipe = |suffix: &str| dir.join(format!("{}-{}", process_id, suffix));
    IoPipes {
        process_id: process_id.to_string(),
        stdin: pipe(STDIN_SUFFIX),
        stdout: pipe(STDOUT_SUFFIX),
        stderr: pipe(STDERR_SUFFIX),
        terminal,
    }
}

/// Creates the three named pipes. Existing pipes are reused.
pub(crate) fn create_fifos(pipes: &IoPipes) -> Result<()> {
    for path in [&pipes.stdin, &pipes.stdout, &pipes.stderr] {
        mkfifo(path)?;
    }
    Ok(())
}

/// Removes the three named pipes, ignoring missing ones.
pub(crate) fn remove_pipes(pipes: &IoPipes) {
    for path in [&pipes.stdin, &pipes.stdout, &pipes.stderr] {
        if let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to remove pipe");
        }
    }
}

/// Reads whatever is buffered in the output pipes without blocking, so a
/// writer stuck on a full pipe can finish.
pub(crate) fn discard_fifos(pipes: &IoPipes) {
    use std::os::unix::fs::OpenOptionsExt;
    for path in [&pipes.stdout, &pipes.stderr] {
        let Ok(mut file) = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        else {
            continue;
        };
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
        let mut drained = 0usize;
        loop {
            match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => drained += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        if drained > 0 {
            debug!(path = %path.display(), bytes = drained, "discarded unread output");
        }
    }
}

fn mkfifo(path: &Path) -> Result<()> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Internal(format!("path contains NUL: {}", path.display())))?;
    // SAFETY: c_path is a valid NUL-terminated path.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o700) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn test_fifo_lifecycle() {
        let dir = tempfile::TempDir::new().unwrap();
        let pipes = pipe_paths(dir.path(), "exec1", false);
        assert!(pipes.stdout.ends_with("exec1-stdout"));

        create_fifos(&pipes).unwrap();
        // Second call is a no-op.
        create_fifos(&pipes).unwrap();
        let meta = std::fs::metadata(&pipes.stderr).unwrap();
        assert!(meta.file_type().is_fifo());

        // No writer: draining returns immediately.
        discard_fifos(&pipes);

        remove_pipes(&pipes);
        assert!(!pipes.stdin.exists());
    }
}
