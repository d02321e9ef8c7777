// src/core/hyperspace.rs

//! The lock/metadata-service seam (Hyperspace).
//!
//! Hyperspace is the serialization point for "which process owns this
//! location" and "which process is the active replication master". The
//! service detects process death (session loss) and releases the dead
//! session's locks, firing `LockReleased` events to watchers.

use crate::core::TesseraError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

pub type HandleId = u64;
pub type SessionId = u64;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ   = 0x1;
        const WRITE  = 0x2;
        const CREATE = 0x4;
        const LOCK   = 0x8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Granted,
    Busy,
}

/// Event delivered to watchers of a named file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HyperspaceEvent {
    LockReleased { path: String },
}

#[async_trait]
pub trait Hyperspace: Send + Sync {
    /// Opens a named file under a session, creating it when `CREATE` is set.
    async fn open(
        &self,
        session: SessionId,
        path: &str,
        flags: OpenFlags,
    ) -> Result<HandleId, TesseraError>;

    /// Closes a handle, releasing any lock it holds.
    async fn close(&self, handle: HandleId) -> Result<(), TesseraError>;

    /// Attempts an exclusive or shared lock without blocking.
    async fn try_lock(&self, handle: HandleId, exclusive: bool)
    -> Result<LockStatus, TesseraError>;

    async fn attr_set(&self, handle: HandleId, name: &str, value: &[u8])
    -> Result<(), TesseraError>;

    async fn attr_get(&self, handle: HandleId, name: &str)
    -> Result<Option<Bytes>, TesseraError>;

    async fn exists(&self, path: &str) -> Result<bool, TesseraError>;

    async fn mkdir(&self, path: &str) -> Result<(), TesseraError>;

    /// Removes a named file; any lock on it is released.
    async fn unlink(&self, path: &str) -> Result<(), TesseraError>;

    /// Subscribes to events on a named file.
    fn subscribe(&self, path: &str) -> broadcast::Receiver<HyperspaceEvent>;

    /// Creates a new session. Sessions own handles; expiring a session
    /// releases all of its locks.
    fn create_session(&self) -> SessionId;

    /// Expires a session, simulating (or reacting to) process death.
    async fn expire_session(&self, session: SessionId) -> Result<(), TesseraError>;
}

struct FileNode {
    attrs: HashMap<String, Bytes>,
    lock_holder: Option<HandleId>,
    shared_holders: Vec<HandleId>,
    is_directory: bool,
}

impl FileNode {
    fn file() -> Self {
        Self {
            attrs: HashMap::new(),
            lock_holder: None,
            shared_holders: Vec::new(),
            is_directory: false,
        }
    }

    fn directory() -> Self {
        Self {
            is_directory: true,
            ..Self::file()
        }
    }
}

struct HandleRec {
    session: SessionId,
    path: String,
}

struct HyperspaceInner {
    nodes: HashMap<String, FileNode>,
    handles: HashMap<HandleId, HandleRec>,
    watchers: HashMap<String, broadcast::Sender<HyperspaceEvent>>,
}

/// In-process Hyperspace implementation. Stands in for a real lock service in
/// tests and single-process deployments; everything else talks to the trait.
pub struct LocalHyperspace {
    inner: Mutex<HyperspaceInner>,
    next_handle: AtomicU64,
    next_session: AtomicU64,
}

impl LocalHyperspace {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HyperspaceInner {
                nodes: HashMap::new(),
                handles: HashMap::new(),
                watchers: HashMap::new(),
            }),
            next_handle: AtomicU64::new(1),
            next_session: AtomicU64::new(1),
        }
    }

    fn release_handle(inner: &mut HyperspaceInner, handle: HandleId) -> Vec<String> {
        let mut released = Vec::new();
        let Some(rec) = inner.handles.remove(&handle) else {
            return released;
        };
        if let Some(node) = inner.nodes.get_mut(&rec.path) {
            if node.lock_holder == Some(handle) {
                node.lock_holder = None;
                released.push(rec.path.clone());
            }
            node.shared_holders.retain(|h| *h != handle);
        }
        released
    }

    fn notify_released(inner: &HyperspaceInner, paths: &[String]) {
        for path in paths {
            if let Some(tx) = inner.watchers.get(path) {
                let _ = tx.send(HyperspaceEvent::LockReleased { path: path.clone() });
            }
        }
    }
}

impl Default for LocalHyperspace {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hyperspace for LocalHyperspace {
    async fn open(
        &self,
        session: SessionId,
        path: &str,
        flags: OpenFlags,
    ) -> Result<HandleId, TesseraError> {
        let mut inner = self.inner.lock();
        if !inner.nodes.contains_key(path) {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(TesseraError::FileNotFound(path.to_string()));
            }
            inner.nodes.insert(path.to_string(), FileNode::file());
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        inner.handles.insert(
            handle,
            HandleRec {
                session,
                path: path.to_string(),
            },
        );
        Ok(handle)
    }

    async fn close(&self, handle: HandleId) -> Result<(), TesseraError> {
        let mut inner = self.inner.lock();
        let released = Self::release_handle(&mut inner, handle);
        Self::notify_released(&inner, &released);
        Ok(())
    }

    async fn try_lock(
        &self,
        handle: HandleId,
        exclusive: bool,
    ) -> Result<LockStatus, TesseraError> {
        let mut inner = self.inner.lock();
        let path = match inner.handles.get(&handle) {
            Some(rec) => rec.path.clone(),
            None => return Err(TesseraError::Hyperspace(format!("bad handle {handle}"))),
        };
        let node = inner
            .nodes
            .get_mut(&path)
            .ok_or_else(|| TesseraError::FileNotFound(path.clone()))?;
        if node.is_directory {
            return Err(TesseraError::Hyperspace(format!(
                "cannot lock directory {path}"
            )));
        }
        if exclusive {
            if node.lock_holder.is_some() || !node.shared_holders.is_empty() {
                return Ok(LockStatus::Busy);
            }
            node.lock_holder = Some(handle);
        } else {
            if node.lock_holder.is_some() {
                return Ok(LockStatus::Busy);
            }
            node.shared_holders.push(handle);
        }
        Ok(LockStatus::Granted)
    }

    async fn attr_set(
        &self,
        handle: HandleId,
        name: &str,
        value: &[u8],
    ) -> Result<(), TesseraError> {
        let mut inner = self.inner.lock();
        let path = match inner.handles.get(&handle) {
            Some(rec) => rec.path.clone(),
            None => return Err(TesseraError::Hyperspace(format!("bad handle {handle}"))),
        };
        let node = inner
            .nodes
            .get_mut(&path)
            .ok_or_else(|| TesseraError::FileNotFound(path.clone()))?;
        node.attrs
            .insert(name.to_string(), Bytes::copy_from_slice(value));
        Ok(())
    }

    async fn attr_get(
        &self,
        handle: HandleId,
        name: &str,
    ) -> Result<Option<Bytes>, TesseraError> {
        let inner = self.inner.lock();
        let path = match inner.handles.get(&handle) {
            Some(rec) => rec.path.clone(),
            None => return Err(TesseraError::Hyperspace(format!("bad handle {handle}"))),
        };
        Ok(inner
            .nodes
            .get(&path)
            .and_then(|node| node.attrs.get(name).cloned()))
    }

    async fn exists(&self, path: &str) -> Result<bool, TesseraError> {
        Ok(self.inner.lock().nodes.contains_key(path))
    }

    async fn mkdir(&self, path: &str) -> Result<(), TesseraError> {
        let mut inner = self.inner.lock();
        inner
            .nodes
            .entry(path.to_string())
            .or_insert_with(FileNode::directory);
        Ok(())
    }

    async fn unlink(&self, path: &str) -> Result<(), TesseraError> {
        let mut inner = self.inner.lock();
        inner.nodes.remove(path);
        inner.handles.retain(|_, rec| rec.path != path);
        if let Some(tx) = inner.watchers.get(path) {
            let _ = tx.send(HyperspaceEvent::LockReleased {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    fn subscribe(&self, path: &str) -> broadcast::Receiver<HyperspaceEvent> {
        let mut inner = self.inner.lock();
        inner
            .watchers
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe()
    }

    fn create_session(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    async fn expire_session(&self, session: SessionId) -> Result<(), TesseraError> {
        let mut inner = self.inner.lock();
        let handles: Vec<HandleId> = inner
            .handles
            .iter()
            .filter(|(_, rec)| rec.session == session)
            .map(|(h, _)| *h)
            .collect();
        let mut released = Vec::new();
        for handle in handles {
            released.extend(Self::release_handle(&mut inner, handle));
        }
        Self::notify_released(&inner, &released);
        Ok(())
    }
}

/// Acquires an exclusive lock on `path` under a fresh handle, returning the
/// handle on success and `LockConflict` when the lock is held elsewhere.
pub async fn try_lock_exclusive(
    hyperspace: &Arc<dyn Hyperspace>,
    session: SessionId,
    path: &str,
) -> Result<HandleId, TesseraError> {
    let handle = hyperspace
        .open(
            session,
            path,
            OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::LOCK,
        )
        .await?;
    match hyperspace.try_lock(handle, true).await? {
        LockStatus::Granted => Ok(handle),
        LockStatus::Busy => {
            hyperspace.close(handle).await?;
            Err(TesseraError::LockConflict(path.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exclusive_lock_conflicts() {
        let hs: Arc<dyn Hyperspace> = Arc::new(LocalHyperspace::new());
        let s1 = hs.create_session();
        let s2 = hs.create_session();

        let h1 = try_lock_exclusive(&hs, s1, "/servers/rs-1").await.unwrap();
        assert!(matches!(
            try_lock_exclusive(&hs, s2, "/servers/rs-1").await,
            Err(TesseraError::LockConflict(_))
        ));

        hs.close(h1).await.unwrap();
        try_lock_exclusive(&hs, s2, "/servers/rs-1").await.unwrap();
    }

    #[tokio::test]
    async fn session_expiry_releases_locks_and_notifies() {
        let hs: Arc<dyn Hyperspace> = Arc::new(LocalHyperspace::new());
        let session = hs.create_session();
        let mut events = hs.subscribe("/replication/rs-slave1");

        try_lock_exclusive(&hs, session, "/replication/rs-slave1")
            .await
            .unwrap();
        hs.expire_session(session).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            HyperspaceEvent::LockReleased {
                path: "/replication/rs-slave1".to_string()
            }
        );

        let other = hs.create_session();
        try_lock_exclusive(&hs, other, "/replication/rs-slave1")
            .await
            .unwrap();
    }
}
