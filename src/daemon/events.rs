//! Lifecycle event log.
//!
//! Every container transition the daemon confirms is logged through
//! `tracing` and published on a broadcast channel. Slow subscribers lag and
//! lose events; publishing never blocks.

use crate::container::Container;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::info;

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub id: String,
    pub name: String,
    /// `create`, `start`, `die`, `oom`, `pause`, `unpause`, `destroy`,
    /// `exec_create`, `exec_start` or `exec_die`.
    pub action: String,
    pub attributes: BTreeMap<String, String>,
    pub time: DateTime<Utc>,
}

/// Broadcast publisher of [`LifecycleEvent`]s.
#[derive(Debug)]
pub struct EventLog {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes `action` for `container` with extra attributes.
    ///
    /// `image` and `name` are always included.
    pub fn log(&self, container: &Container, action: &str, extra: &[(&str, String)]) {
        let mut attributes = BTreeMap::new();
        attributes.insert("image".to_string(), container.config.image.clone());
        attributes.insert("name".to_string(), container.name.clone());
        for (key, value) in extra {
            attributes.insert((*key).to_string(), value.clone());
        }

        info!(
            container = %container.short_id(),
            name = %container.name,
            action,
            ?attributes,
            "container event"
        );

        // No subscribers is fine.
        let _ = self.tx.send(LifecycleEvent {
            id: container.id.clone(),
            name: container.name.clone(),
            action: action.to_string(),
            attributes,
            time: Utc::now(),
        });
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }
}
