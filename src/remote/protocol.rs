//! Wire protocol of the remote execution backend.
//!
//! # Protocol Format
//!
//! - **Transport**: Unix domain socket
//! - **Encoding**: JSON
//! - **Framing**: Newline-delimited (each message ends with `\n`)
//!
//! # Request/Response Flow
//!
//! ```text
//! berthd                           backend
//!   |                                 |
//!   |  {"action":"create",...}\n      |
//!   |-------------------------------->|
//!   |  {"status":"ok","pid":42}\n     |
//!   |<--------------------------------|
//! ```
//!
//! A `subscribe` request is acknowledged like any other; the backend then
//! keeps the connection open and writes one [`EventMessage`] per line.
//!
//! | Action | Description |
//! |--------|-------------|
//! | `create` | Create and start a container from a bundle |
//! | `add_process` | Start an auxiliary process |
//! | `signal` | Signal one process |
//! | `set_paused` | Freeze or thaw a container |
//! | `subscribe` | Open the event stream |
//! | `ping` | Check backend availability |

use crate::runtime::{AddProcessRequest, BackendEvent, CreateRequest, EventKind};
use serde::{Deserialize, Serialize};

// =============================================================================
// Request Types
// =============================================================================

/// Request from the daemon to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    Create(CreateRequest),
    AddProcess(AddProcessRequest),
    Signal {
        container_id: String,
        process_id: String,
        /// Signal number.
        signal: i32,
    },
    SetPaused {
        container_id: String,
        paused: bool,
    },
    Subscribe,
    Ping,
}

// =============================================================================
// Response Types
// =============================================================================

/// Response from the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Ok {
        /// System PID, for `create` and `add_process`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Error {
        /// Backend error text, surfaced verbatim.
        message: String,
    },
}

impl Response {
    /// Creates a success response with no data.
    #[must_use]
    pub fn ok() -> Self {
        Self::Ok { pid: None }
    }

    /// Creates a success response carrying a PID.
    #[must_use]
    pub fn ok_with_pid(pid: u32) -> Self {
        Self::Ok { pid: Some(pid) }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// One event on the subscription stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessage {
    pub container_id: String,
    pub process_id: String,
    /// `exit`, `pause`, `resume`, `oom` or a kind the daemon ignores.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub exit_status: u32,
}

impl From<EventMessage> for BackendEvent {
    fn from(msg: EventMessage) -> Self {
        Self {
            container_id: msg.container_id,
            process_id: msg.process_id,
            kind: EventKind::parse(&msg.kind),
            exit_status: msg.exit_status,
        }
    }
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

macro_rules! json_lines {
    ($($ty:ty),*) => {$(
        impl $ty {
            /// Serializes to a JSON line (with newline).
            ///
            /// # Errors
            ///
            /// Returns error if JSON serialization fails.
            pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
                let mut json = serde_json::to_string(self)?;
                json.push('\n');
                Ok(json)
            }

            /// Deserializes from JSON.
            ///
            /// # Errors
            ///
            /// Returns error if JSON deserialization fails.
            pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
                serde_json::from_str(s.trim())
            }
        }
    )*};
}

json_lines!(Request, Response, EventMessage);

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_response_serialization() {
        let json = Response::ok_with_pid(42).to_json_line().unwrap();
        assert_eq!(json, "{\"status\":\"ok\",\"pid\":42}\n");

        let json = Response::error("exec: \"nope\": executable file not found in $PATH")
            .to_json_line()
            .unwrap();
        assert!(json.contains("\"status\":\"error\""));
        assert!(json.contains("executable file not found"));
    }

    #[test]
    fn test_create_request() {
        let req = Request::Create(CreateRequest {
            id: "abc".to_string(),
            bundle_path: PathBuf::from("/run/berth/bundles/abc"),
            stdin: PathBuf::from("/run/berth/bundles/abc/init-stdin"),
            stdout: PathBuf::from("/run/berth/bundles/abc/init-stdout"),
            stderr: PathBuf::from("/run/berth/bundles/abc/init-stderr"),
            no_pivot_root: false,
        });
        let json = req.to_json_line().unwrap();
        assert!(json.contains("\"action\":\"create\""));
        assert!(json.contains("\"bundle_path\":\"/run/berth/bundles/abc\""));
        assert_eq!(Request::from_json(&json).unwrap(), req);
    }

    #[test]
    fn test_ping_request() {
        let json = Request::Ping.to_json_line().unwrap();
        assert_eq!(json, "{\"action\":\"ping\"}\n");
    }

    #[test]
    fn test_event_message() {
        let msg = EventMessage::from_json(
            r#"{"container_id":"abc","process_id":"init","type":"exit","exit_status":3}"#,
        )
        .unwrap();
        let event = BackendEvent::from(msg);
        assert_eq!(event.kind, EventKind::Exit);
        assert_eq!(event.exit_status, 3);

        let msg = EventMessage::from_json(
            r#"{"container_id":"abc","process_id":"init","type":"start-container"}"#,
        )
        .unwrap();
        assert_eq!(
            BackendEvent::from(msg).kind,
            EventKind::Other("start-container".to_string())
        );
    }
}
