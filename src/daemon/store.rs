//! Container registry.
//!
//! The index (ID and name lookup) sits behind its own `RwLock`, which is
//! never held across an await. Each registered container lives in a
//! [`ContainerHandle`] carrying the per-container async lock, a status
//! snapshot observable without that lock, and the attach context of its
//! stream copiers.

use crate::container::{Container, RunState};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{MutexGuard, watch};
use tokio_util::sync::CancellationToken;

/// Point-in-time view of a container's run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: RunState,
    pub pid: u32,
    pub exit_code: i32,
}

impl StatusSnapshot {
    fn of(container: &Container) -> Self {
        Self {
            status: container.state.status,
            pid: container.state.pid,
            exit_code: container.state.exit_code,
        }
    }
}

/// A registered container.
#[derive(Debug)]
pub struct ContainerHandle {
    id: String,
    name: String,
    root: PathBuf,
    container: tokio::sync::Mutex<Container>,
    status: watch::Sender<StatusSnapshot>,
    attach: Mutex<Option<CancellationToken>>,
}

impl ContainerHandle {
    fn new(container: Container) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::of(&container));
        Self {
            id: container.id.clone(),
            name: container.name.clone(),
            root: container.root.clone(),
            container: tokio::sync::Mutex::new(container),
            status,
            attach: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Metadata directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Acquires the per-container lock.
    pub async fn lock(&self) -> MutexGuard<'_, Container> {
        self.container.lock().await
    }

    /// Latest published status.
    pub fn status(&self) -> StatusSnapshot {
        *self.status.borrow()
    }

    /// Watches status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Publishes the container's current status. Call with the lock held,
    /// after mutating state.
    pub fn publish(&self, container: &Container) {
        let snapshot = StatusSnapshot::of(container);
        self.status.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Returns the attach context, creating one if none is active.
    pub fn attach_context(&self) -> CancellationToken {
        let mut attach = self.attach.lock().unwrap_or_else(|e| e.into_inner());
        attach.get_or_insert_with(CancellationToken::new).clone()
    }

    /// Cancels stream copiers of the current run.
    pub fn cancel_attach(&self) {
        let token = self
            .attach
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct Index {
    by_id: HashMap<String, Arc<ContainerHandle>>,
    /// name -> id
    names: HashMap<String, String>,
}

/// All registered containers.
#[derive(Debug, Default)]
pub struct ContainerStore {
    index: RwLock<Index>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a container. Name and ID must both be unused.
    pub fn add(&self, container: Container) -> Result<Arc<ContainerHandle>> {
        let mut index = self.write()?;
        if index.by_id.contains_key(&container.id) {
            return Err(Error::IdConflict(container.id));
        }
        if let Some(owner) = index.names.get(&container.name) {
            return Err(Error::NameConflict {
                name: container.name,
                id: owner.clone(),
            });
        }
        let handle = Arc::new(ContainerHandle::new(container));
        index
            .names
            .insert(handle.name.clone(), handle.id.clone());
        index.by_id.insert(handle.id.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Looks up by full ID, name (with or without leading `/`), or unique
    /// ID prefix, in that order.
    pub fn get(&self, reference: &str) -> Result<Arc<ContainerHandle>> {
        let index = self.read()?;
        if let Some(handle) = index.by_id.get(reference) {
            return Ok(Arc::clone(handle));
        }
        let name = reference.strip_prefix('/').unwrap_or(reference);
        if let Some(handle) = index.names.get(name).and_then(|id| index.by_id.get(id)) {
            return Ok(Arc::clone(handle));
        }
        if reference.is_empty() {
            return Err(Error::ContainerNotFound(reference.to_string()));
        }
        let mut matches = index
            .by_id
            .iter()
            .filter(|(id, _)| id.starts_with(reference));
        match (matches.next(), matches.next()) {
            (Some((_, handle)), None) => Ok(Arc::clone(handle)),
            (Some(_), Some(_)) => Err(Error::AmbiguousId(reference.to_string())),
            _ => Err(Error::ContainerNotFound(reference.to_string())),
        }
    }

    /// Looks up by exact ID.
    pub fn get_by_id(&self, id: &str) -> Option<Arc<ContainerHandle>> {
        self.read().ok()?.by_id.get(id).cloned()
    }

    /// Returns the ID registered under `name`.
    pub fn id_for_name(&self, name: &str) -> Option<String> {
        self.read().ok()?.names.get(name).cloned()
    }

    /// Unregisters a container.
    pub fn remove(&self, id: &str) -> Option<Arc<ContainerHandle>> {
        let mut index = self.write().ok()?;
        let handle = index.by_id.remove(id)?;
        index.names.remove(handle.name());
        Some(handle)
    }

    /// All registered containers, oldest ID first for stable output.
    pub fn list(&self) -> Vec<Arc<ContainerHandle>> {
        let Ok(index) = self.read() else {
            return Vec::new();
        };
        let mut handles: Vec<_> = index.by_id.values().cloned().collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub fn len(&self) -> usize {
        self.read().map(|i| i.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Index>> {
        self.index
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Index>> {
        self.index
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, HostConfig};

    fn container(id: &str, name: &str) -> Container {
        Container::new(
            id,
            name,
            PathBuf::from("/tmp").join(id),
            ContainerConfig::default(),
            HostConfig::default(),
            "img",
        )
    }

    #[test]
    fn test_lookup_by_name_id_and_prefix() {
        let store = ContainerStore::new();
        store.add(container("abcdef01", "web")).unwrap();
        store.add(container("abd00000", "db")).unwrap();

        assert_eq!(store.get("web").unwrap().id(), "abcdef01");
        assert_eq!(store.get("/db").unwrap().id(), "abd00000");
        assert_eq!(store.get("abc").unwrap().id(), "abcdef01");
        assert!(matches!(store.get("ab"), Err(Error::AmbiguousId(_))));
        assert!(matches!(store.get("zz"), Err(Error::ContainerNotFound(_))));
    }

    #[test]
    fn test_conflicts() {
        let store = ContainerStore::new();
        store.add(container("abcdef01", "web")).unwrap();
        assert!(matches!(
            store.add(container("abcdef01", "other")),
            Err(Error::IdConflict(_))
        ));
        assert!(matches!(
            store.add(container("12345678", "web")),
            Err(Error::NameConflict { .. })
        ));
        store.remove("abcdef01").unwrap();
        assert!(store.add(container("12345678", "web")).is_ok());
    }
}
