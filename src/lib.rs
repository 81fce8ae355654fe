//! # berth
//!
//! **Container Lifecycle Daemon Core**
//!
//! This crate sequences the life of containers on one host: it provisions
//! storage, volumes and networking around a start, hands the process to an
//! execution backend, reconciles the backend's asynchronous events with
//! locally initiated requests, applies restart policy, and tears everything
//! down again in a fixed order.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                              berth                                  │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │                     Daemon (orchestrator)                   │    │
//! │  │  create → start → stop/pause/exec → remove, restore, events │    │
//! │  └──────────────┬──────────────────────────────▲───────────────┘    │
//! │                 │ create/signal/pause          │ StateBridge        │
//! │  ┌──────────────▼──────────────────────────────┴───────────────┐    │
//! │  │                    Client (reconciler)                      │    │
//! │  │  shadow state │ per-key locks │ ordered queues │ restarts   │    │
//! │  └──────────────┬──────────────────────────────▲───────────────┘    │
//! │                 │ ExecutionBackend             │ BackendEvent       │
//! ├─────────────────┼──────────────────────────────┼────────────────────┤
//! │  ┌──────────────▼──────────────────────────────┴───────────────┐    │
//! │  │     RemoteBackend (JSON lines over a Unix socket)           │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Images, writable layers, volumes, networking and security labels are
//! collaborator traits ([`daemon::Collaborators`]); [`local`] has
//! directory-backed implementations.
//!
//! # Container Lifecycle
//!
//! ```text
//!   ┌─────────┐  start   ┌─────────┐  pause   ┌────────┐
//!   │ Created │ ───────► │ Running │ ◄──────► │ Paused │
//!   └─────────┘          └────┬────┘ unpause  └────────┘
//!        ▲                    │ exit
//!        │           policy   ▼
//!        │        ┌────────────┐ no restart ┌────────┐  remove  ┌──────┐
//!        │        │ Restarting │ ─────────► │ Exited │ ───────► │ Dead │
//!        │        └────────────┘            └────────┘          └──────┘
//!        │              │ relaunch               │
//!        └──────────────┴──── Running ◄──────────┘ start
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use berth::{Daemon, DaemonConfig, CreateParams, RemoteBackend};
//!
//! let daemon = Daemon::new(config, Arc::new(RemoteBackend::new(socket)), collaborators, platform)?;
//! let events = daemon.spawn_event_loop(shutdown.clone());
//! let created = daemon.create(CreateParams { config: Some(cfg), ..Default::default() }).await?;
//! daemon.start(&created.id).await?;
//! ```

pub mod bundle;
pub mod client;
pub mod config;
pub mod constants;
pub mod container;
pub mod daemon;
pub mod error;
pub mod local;
pub mod platform;
pub mod remote;
pub mod restart;
pub mod runtime;

// Re-exports
pub use client::{Client, ClientOptions};
pub use config::DaemonConfig;
pub use container::{Container, ContainerConfig, HostConfig, NetworkingConfig, RunState};
pub use daemon::{
    Collaborators, CreateParams, CreateResponse, Daemon, ExecOptions, LifecycleEvent,
    RemoveOptions, StartOutcome, StopOutcome,
};
pub use error::{Error, Result};
pub use platform::{LinuxPlatform, Platform, PlatformOps};
pub use remote::RemoteBackend;
pub use restart::{RestartManager, RestartPolicy};
pub use runtime::{BackendEvent, EventKind, ExecutionBackend, Signal, StateBridge};
