//! Output stream copiers.
//!
//! Each started process gets one task per output pipe that copies lines into
//! a JSON-lines log next to the container record:
//!
//! ```json
//! {"log":"hello\n","stream":"stdout","time":"2024-01-01T00:00:00Z"}
//! ```
//!
//! Copiers run until the attach context is cancelled (cleanup, or a new run
//! of the init process). The stdin pipe is left to the backend.

use crate::error::Result;
use crate::runtime::IoPipes;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Starts copiers for the output pipes of one process.
pub(super) async fn attach(pipes: &IoPipes, log_path: &Path, token: CancellationToken) -> Result<()> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    let log = Arc::new(Mutex::new(log));

    spawn_copier(open_receiver(&pipes.stdout)?, "stdout", Arc::clone(&log), token.clone());
    if !pipes.terminal {
        spawn_copier(open_receiver(&pipes.stderr)?, "stderr", log, token);
    }
    Ok(())
}

/// Opens a FIFO for reading without waiting for a writer.
fn open_receiver(path: &Path) -> Result<pipe::Receiver> {
    let mut options = pipe::OpenOptions::new();
    // Holding the write side too keeps the reader from seeing EOF between
    // writers.
    #[cfg(target_os = "linux")]
    options.read_write(true);
    Ok(options.open_receiver(path)?)
}

fn spawn_copier(
    receiver: pipe::Receiver,
    stream: &'static str,
    log: Arc<Mutex<File>>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(receiver).lines();
        loop {
            let line = tokio::select! {
                _ = token.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    debug!(stream, error = %e, "stream copier stopped");
                    break;
                }
            };
            let entry = serde_json::json!({
                "log": format!("{}\n", line),
                "stream": stream,
                "time": Utc::now(),
            });
            let mut record = entry.to_string();
            record.push('\n');
            if let Err(e) = log.lock().await.write_all(record.as_bytes()).await {
                debug!(stream, error = %e, "failed to write log entry");
                break;
            }
        }
    });
}
