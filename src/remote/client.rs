//! Unix-socket client for the remote execution backend.
//!
//! Each request opens a connection, writes one request line, reads one
//! response line and closes. The event subscription keeps its connection
//! open and is read by a background task.

use super::protocol::{EventMessage, Request, Response};
use crate::constants::{
    BACKEND_CONNECT_TIMEOUT, BACKEND_EVENT_CAPACITY, BACKEND_RPC_TIMEOUT, MAX_REMOTE_MESSAGE_SIZE,
};
use crate::error::{Error, Result};
use crate::runtime::{AddProcessRequest, BackendEvent, CreateRequest, ExecutionBackend, Signal};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Execution backend reached over a Unix socket.
#[derive(Debug, Clone)]
pub struct RemoteBackend {
    socket: PathBuf,
    /// Per-request timeout.
    timeout: Duration,
    connect_timeout: Duration,
}

impl RemoteBackend {
    /// Creates a client for the backend listening on `socket`.
    #[must_use]
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            timeout: BACKEND_RPC_TIMEOUT,
            connect_timeout: BACKEND_CONNECT_TIMEOUT,
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the socket path.
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Checks that the backend answers.
    pub async fn ping(&self) -> Result<()> {
        self.call(&Request::Ping).await.map(|_| ())
    }

    async fn connect(&self) -> Result<UnixStream> {
        timeout(self.connect_timeout, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("connect to backend at {}", self.socket.display()),
                duration: self.connect_timeout,
            })?
            .map_err(Error::from)
    }

    /// Sends `request` on a fresh connection. Returns the response and the
    /// connection, with the reader positioned after the response.
    async fn exchange(
        &self,
        request: &Request,
    ) -> Result<(Response, BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
        let stream = self.connect().await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let line = request
            .to_json_line()
            .map_err(|e| Error::Serialization(e.to_string()))?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let response = timeout(self.timeout, read_message(&mut reader))
            .await
            .map_err(|_| Error::Timeout {
                operation: "backend request".to_string(),
                duration: self.timeout,
            })??
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "backend closed connection without a response",
                ))
            })?;
        let response =
            Response::from_json(&response).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok((response, reader, writer))
    }

    /// Issues one request. Backend errors come back as [`Error::Backend`]
    /// with the message untouched.
    async fn call(&self, request: &Request) -> Result<Option<u32>> {
        match self.exchange(request).await?.0 {
            Response::Ok { pid } => Ok(pid),
            Response::Error { message } => Err(Error::Backend(message)),
        }
    }

    async fn call_for_pid(&self, request: &Request) -> Result<u32> {
        self.call(request).await?.ok_or_else(|| {
            Error::Serialization("backend response is missing the process ID".to_string())
        })
    }
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    fn name(&self) -> &str {
        "remote"
    }

    async fn create_container(&self, request: CreateRequest) -> Result<u32> {
        debug!(container = %request.id, bundle = %request.bundle_path.display(), "create");
        self.call_for_pid(&Request::Create(request)).await
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>> {
        let (response, mut reader, writer) = self.exchange(&Request::Subscribe).await?;
        if let Response::Error { message } = response {
            return Err(Error::Backend(message));
        }

        let (tx, rx) = mpsc::channel(BACKEND_EVENT_CAPACITY);
        let socket = self.socket.clone();
        tokio::spawn(async move {
            // Dropping the write half would half-close the subscription.
            let _writer = writer;
            loop {
                let line = match read_message(&mut reader).await {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!(socket = %socket.display(), "backend closed event stream");
                        break;
                    }
                    Err(e) => {
                        warn!(socket = %socket.display(), error = %e, "event stream failed");
                        break;
                    }
                };
                let message = match EventMessage::from_json(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(error = %e, "malformed backend event");
                        continue;
                    }
                };
                if tx.send(message.into()).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn signal(&self, container_id: &str, process_id: &str, signal: Signal) -> Result<()> {
        self.call(&Request::Signal {
            container_id: container_id.to_string(),
            process_id: process_id.to_string(),
            signal: signal.as_i32(),
        })
        .await
        .map(|_| ())
    }

    async fn add_process(&self, request: AddProcessRequest) -> Result<u32> {
        self.call_for_pid(&Request::AddProcess(request)).await
    }

    async fn set_paused(&self, container_id: &str, paused: bool) -> Result<()> {
        self.call(&Request::SetPaused {
            container_id: container_id.to_string(),
            paused,
        })
        .await
        .map(|_| ())
    }
}

/// Reads one line, refusing lines over the message size limit.
async fn read_message<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    let limit = MAX_REMOTE_MESSAGE_SIZE as u64 + 1;
    let n = (&mut *reader).take(limit).read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if n as u64 >= limit {
        return Err(Error::Serialization(format!(
            "backend message exceeds {} bytes",
            MAX_REMOTE_MESSAGE_SIZE
        )));
    }
    Ok(Some(line))
}
