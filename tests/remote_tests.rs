//! Tests for the remote execution backend client.
//!
//! A scripted backend listens on a Unix socket in a temp directory and
//! answers each request line with whatever the test's handler returns.

use berth::constants::MAX_REMOTE_MESSAGE_SIZE;
use berth::remote::{EventMessage, Request, Response};
use berth::runtime::{CreateRequest, EventKind, ExecutionBackend, Signal};
use berth::{Error, RemoteBackend};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

const WAIT: Duration = Duration::from_secs(10);

/// What the scripted backend writes back for one request: the response
/// line followed by any extra lines (events after a subscribe).
type Handler = Arc<dyn Fn(&Request) -> Vec<String> + Send + Sync>;

struct FakeServer {
    _dir: TempDir,
    socket: PathBuf,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl FakeServer {
    fn start(handler: impl Fn(&Request) -> Vec<String> + Send + Sync + 'static) -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("backend.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let handler = handler.clone();
                let seen = seen.clone();
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut reader = BufReader::new(reader);
                    let mut line = String::new();
                    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let request = Request::from_json(&line).unwrap();
                    let replies = handler(&request);
                    seen.lock().unwrap().push(request);
                    for reply in replies {
                        if writer.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    // Hold the connection open like a real event stream.
                    let _ = reader.read_line(&mut line).await;
                });
            }
        });

        Self {
            _dir: dir,
            socket,
            requests,
        }
    }

    fn backend(&self) -> RemoteBackend {
        RemoteBackend::new(&self.socket).with_timeout(Duration::from_secs(2))
    }

    fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

fn reply(response: Response) -> Vec<String> {
    vec![response.to_json_line().unwrap()]
}

fn event_line(container_id: &str, kind: &str, exit_status: u32) -> String {
    EventMessage {
        container_id: container_id.to_string(),
        process_id: "init".to_string(),
        kind: kind.to_string(),
        exit_status,
    }
    .to_json_line()
    .unwrap()
}

fn create_request(id: &str, bundle: &Path) -> CreateRequest {
    CreateRequest {
        id: id.to_string(),
        bundle_path: bundle.to_path_buf(),
        stdin: bundle.join("init-stdin"),
        stdout: bundle.join("init-stdout"),
        stderr: bundle.join("init-stderr"),
        no_pivot_root: false,
    }
}

// =============================================================================
// Requests
// =============================================================================

#[tokio::test]
async fn test_ping() {
    let server = FakeServer::start(|_| reply(Response::ok()));
    server.backend().ping().await.unwrap();
    assert_eq!(server.requests(), vec![Request::Ping]);
}

#[tokio::test]
async fn test_ping_without_backend() {
    let dir = TempDir::new().unwrap();
    let backend = RemoteBackend::new(dir.path().join("missing.sock"));
    assert!(matches!(backend.ping().await.unwrap_err(), Error::Io(_)));
}

#[tokio::test]
async fn test_create_returns_pid() {
    let server = FakeServer::start(|request| match request {
        Request::Create(_) => reply(Response::ok_with_pid(4242)),
        _ => reply(Response::error("unexpected request")),
    });
    let bundle = PathBuf::from("/run/berth/abc");
    let pid = server
        .backend()
        .create_container(create_request("abc", &bundle))
        .await
        .unwrap();
    assert_eq!(pid, 4242);

    match &server.requests()[0] {
        Request::Create(req) => {
            assert_eq!(req.id, "abc");
            assert_eq!(req.bundle_path, bundle);
        }
        other => panic!("unexpected request {:?}", other),
    }
}

#[tokio::test]
async fn test_create_without_pid_is_an_error() {
    let server = FakeServer::start(|_| reply(Response::ok()));
    let err = server
        .backend()
        .create_container(create_request("abc", Path::new("/run/berth/abc")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

#[tokio::test]
async fn test_backend_error_is_verbatim() {
    let message = "exec: \"nope\": executable file not found in $PATH";
    let server = FakeServer::start(move |_| reply(Response::error(message)));
    let err = server
        .backend()
        .create_container(create_request("abc", Path::new("/run/berth/abc")))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), message);

    // The daemon maps it onto the command error.
    let err = err.classify_start("nope");
    assert_eq!(err.exit_code(), Some(127));
}

#[tokio::test]
async fn test_signal_and_pause_requests() {
    let server = FakeServer::start(|_| reply(Response::ok()));
    let backend = server.backend();
    backend.signal("abc", "init", Signal::Term).await.unwrap();
    backend.set_paused("abc", true).await.unwrap();

    assert_eq!(
        server.requests(),
        vec![
            Request::Signal {
                container_id: "abc".to_string(),
                process_id: "init".to_string(),
                signal: 15,
            },
            Request::SetPaused {
                container_id: "abc".to_string(),
                paused: true,
            },
        ]
    );
}

#[tokio::test]
async fn test_garbage_response() {
    let server = FakeServer::start(|_| vec!["this is not json\n".to_string()]);
    let err = server.backend().ping().await.unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

#[tokio::test]
async fn test_oversized_response() {
    let server = FakeServer::start(|_| {
        let mut line = "x".repeat(MAX_REMOTE_MESSAGE_SIZE + 16);
        line.push('\n');
        vec![line]
    });
    let err = server.backend().ping().await.unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

#[tokio::test]
async fn test_silent_backend_times_out() {
    let server = FakeServer::start(|_| Vec::new());
    let backend = RemoteBackend::new(&server.socket).with_timeout(Duration::from_millis(100));
    assert!(matches!(
        backend.ping().await.unwrap_err(),
        Error::Timeout { .. }
    ));
}

// =============================================================================
// Event Subscription
// =============================================================================

#[tokio::test]
async fn test_subscribe_streams_events() {
    let server = FakeServer::start(|request| match request {
        Request::Subscribe => vec![
            Response::ok().to_json_line().unwrap(),
            event_line("abc", "exit", 3),
            "{broken\n".to_string(),
            event_line("abc", "oom", 0),
            event_line("abc", "start-container", 0),
        ],
        _ => reply(Response::error("unexpected request")),
    });
    let mut events = server.backend().subscribe().await.unwrap();

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(WAIT, events.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(event);
    }
    assert_eq!(received[0].container_id, "abc");
    assert_eq!(received[0].kind, EventKind::Exit);
    assert_eq!(received[0].exit_status, 3);
    // The malformed line was skipped.
    assert_eq!(received[1].kind, EventKind::Oom);
    assert_eq!(
        received[2].kind,
        EventKind::Other("start-container".to_string())
    );
}

#[tokio::test]
async fn test_subscribe_refused() {
    let server = FakeServer::start(|_| reply(Response::error("too many subscribers")));
    let err = server.backend().subscribe().await.unwrap_err();
    assert_eq!(err.to_string(), "too many subscribers");
}
