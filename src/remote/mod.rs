//! # Remote Execution Backend
//!
//! [`RemoteBackend`] implements [`ExecutionBackend`](crate::runtime::ExecutionBackend)
//! by talking newline-delimited JSON to a backend process over a Unix socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐          ┌──────────────────────────┐
//! │  berthd                      │          │  backend                 │
//! │  ┌────────────────────────┐  │  unix    │                          │
//! │  │ Client ─► RemoteBackend│──┼─socket──►│  create / signal / ...   │
//! │  │        ◄── event task  │◄─┼──────────│  event stream            │
//! │  └────────────────────────┘  │          │                          │
//! └──────────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! The daemon core does not depend on this format; it only sees the trait.

pub mod client;
pub mod protocol;

pub use client::RemoteBackend;
pub use protocol::{EventMessage, Request, Response};
