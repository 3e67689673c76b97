//! In-Process Coordination Ensemble
//!
//! A single-process implementation of the coordination capabilities, shared by every
//! node of a sandbox or test cluster through `Arc`. It keeps a hierarchical map of
//! nodes, a session table with heartbeat-based expiry, and a broadcast change feed.
//!
//! Failure injection hooks mirror what a real deployment goes through:
//! - `set_available(false)` simulates a lost quorum: every call fails with
//!   `ConnectionLoss` and no session expires until the service is back.
//! - `block_session(id, true)` simulates a broken client socket for one session.
//! - `expire_session(id)` expires a session immediately.

use super::{CoordinationStore, CreateMode, SessionId, StoreError, StoreResult, Versioned, WatchEvent};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const REAPER_INTERVAL: Duration = Duration::from_millis(25);
const WATCH_CAPACITY: usize = 4096;

struct ZNode {
    data: Vec<u8>,
    version: u64,
    owner: Option<SessionId>,
    next_sequence: u64,
}

struct SessionEntry {
    timeout: Duration,
    last_heartbeat: Instant,
    blocked: bool,
}

struct Inner {
    nodes: Mutex<BTreeMap<String, ZNode>>,
    sessions: DashMap<SessionId, SessionEntry>,
    next_session: AtomicU64,
    available: AtomicBool,
    events: broadcast::Sender<WatchEvent>,
}

/// Shared in-memory coordination service.
#[derive(Clone)]
pub struct MemoryEnsemble {
    inner: Arc<Inner>,
}

impl MemoryEnsemble {
    /// Creates an empty ensemble. When called inside a tokio runtime a background
    /// reaper expires sessions that stopped heartbeating.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                version: 0,
                owner: None,
                next_sequence: 0,
            },
        );

        let inner = Arc::new(Inner {
            nodes: Mutex::new(nodes),
            sessions: DashMap::new(),
            next_session: AtomicU64::new(1),
            available: AtomicBool::new(true),
            events,
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let weak = Arc::downgrade(&inner);
            handle.spawn(reaper_loop(weak));
        }

        Self { inner }
    }

    /// Toggles the availability of the whole service.
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if available && !was {
            // A restored quorum grants every session a fresh timeout.
            let now = Instant::now();
            for mut entry in self.inner.sessions.iter_mut() {
                entry.last_heartbeat = now;
            }
            tracing::info!("Coordination ensemble available again");
        } else if !available && was {
            tracing::warn!("Coordination ensemble unavailable");
        }
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Cuts (or restores) the connection of a single session.
    pub fn block_session(&self, session: SessionId, blocked: bool) {
        if let Some(mut entry) = self.inner.sessions.get_mut(&session) {
            entry.blocked = blocked;
            if !blocked {
                entry.last_heartbeat = Instant::now();
            }
        }
    }

    /// Expires a session right away, as if its timeout had elapsed.
    pub fn expire_session(&self, session: SessionId) {
        if self.inner.sessions.remove(&session).is_some() {
            tracing::info!("Expiring coordination session {}", session);
            self.inner.drop_ephemerals(session);
            let _ = self.inner.events.send(WatchEvent::SessionExpired(session));
        }
    }

    pub fn is_session_alive(&self, session: SessionId) -> bool {
        self.inner.sessions.contains_key(&session)
    }

    /// Child names of `path`, bypassing sessions. Diagnostics only.
    pub fn list(&self, path: &str) -> Vec<String> {
        let nodes = self.inner.nodes.lock();
        Inner::child_names(&nodes, path)
    }

    /// Whether `path` exists, bypassing sessions. Diagnostics only.
    pub fn node_exists(&self, path: &str) -> bool {
        self.inner.nodes.lock().contains_key(path)
    }

    fn check(&self, session: SessionId) -> StoreResult<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        self.inner.reap();
        match self.inner.sessions.get(&session) {
            Some(entry) if entry.blocked => Err(StoreError::ConnectionLoss),
            Some(_) => Ok(()),
            None => Err(StoreError::SessionExpired(session)),
        }
    }
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn reap(&self) {
        if !self.available.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| now.duration_since(entry.last_heartbeat) > entry.timeout)
            .map(|entry| *entry.key())
            .collect();

        for session in expired {
            if self.sessions.remove(&session).is_some() {
                tracing::info!("Coordination session {} timed out", session);
                self.drop_ephemerals(session);
                let _ = self.events.send(WatchEvent::SessionExpired(session));
            }
        }
    }

    fn drop_ephemerals(&self, session: SessionId) {
        let removed: Vec<String> = {
            let mut nodes = self.nodes.lock();
            let owned: Vec<String> = nodes
                .iter()
                .filter(|(_, node)| node.owner == Some(session))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                nodes.remove(path);
            }
            owned
        };

        for path in removed {
            let _ = self.events.send(WatchEvent::Deleted(path));
        }
    }

    fn child_names(nodes: &BTreeMap<String, ZNode>, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    fn insert(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> StoreResult<()> {
        let parent = parent_of(path).ok_or_else(|| StoreError::NoNode(path.to_string()))?;
        {
            let mut nodes = self.nodes.lock();
            if nodes.contains_key(path) {
                return Err(StoreError::NodeExists(path.to_string()));
            }
            match nodes.get(parent) {
                None => return Err(StoreError::NoNode(parent.to_string())),
                Some(node) if node.owner.is_some() => {
                    return Err(StoreError::NoChildrenForEphemerals(parent.to_string()));
                }
                Some(_) => {}
            }
            nodes.insert(
                path.to_string(),
                ZNode {
                    data,
                    version: 0,
                    owner: match mode {
                        CreateMode::Persistent => None,
                        CreateMode::Ephemeral => Some(session),
                    },
                    next_sequence: 0,
                },
            );
        }
        let _ = self.events.send(WatchEvent::Created(path.to_string()));
        Ok(())
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" || !path.starts_with('/') {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

async fn reaper_loop(inner: Weak<Inner>) {
    let mut interval = tokio::time::interval(REAPER_INTERVAL);
    loop {
        interval.tick().await;
        match inner.upgrade() {
            Some(inner) => inner.reap(),
            None => break,
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryEnsemble {
    async fn open_session(&self, timeout: Duration) -> StoreResult<SessionId> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionLoss);
        }
        let session = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        self.inner.sessions.insert(
            session,
            SessionEntry {
                timeout,
                last_heartbeat: Instant::now(),
                blocked: false,
            },
        );
        tracing::debug!("Opened coordination session {} (timeout {:?})", session, timeout);
        Ok(session)
    }

    async fn heartbeat(&self, session: SessionId) -> StoreResult<()> {
        self.check(session)?;
        if let Some(mut entry) = self.inner.sessions.get_mut(&session) {
            entry.last_heartbeat = Instant::now();
        }
        Ok(())
    }

    async fn close_session(&self, session: SessionId) -> StoreResult<()> {
        self.check(session)?;
        if self.inner.sessions.remove(&session).is_some() {
            tracing::debug!("Closed coordination session {}", session);
            self.inner.drop_ephemerals(session);
        }
        Ok(())
    }

    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> StoreResult<()> {
        self.check(session)?;
        self.inner.insert(session, path, data, mode)
    }

    async fn create_sequential(
        &self,
        session: SessionId,
        parent: &str,
        suffix: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> StoreResult<String> {
        self.check(session)?;
        let name = {
            let mut nodes = self.inner.nodes.lock();
            let parent_node = nodes
                .get_mut(parent)
                .ok_or_else(|| StoreError::NoNode(parent.to_string()))?;
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            if suffix.is_empty() {
                format!("{:010}", sequence)
            } else {
                format!("{:010}-{}", sequence, suffix)
            }
        };

        let path = if parent == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent, name)
        };
        self.inner.insert(session, &path, data, mode)?;
        Ok(name)
    }

    async fn get(&self, session: SessionId, path: &str) -> StoreResult<Option<Versioned>> {
        self.check(session)?;
        let nodes = self.inner.nodes.lock();
        Ok(nodes.get(path).map(|node| Versioned {
            data: node.data.clone(),
            version: node.version,
            owner: node.owner,
        }))
    }

    async fn set(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        self.check(session)?;
        let version = {
            let mut nodes = self.inner.nodes.lock();
            let node = nodes
                .get_mut(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if let Some(expected) = expected_version
                && expected != node.version
            {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
            node.data = data;
            node.version += 1;
            node.version
        };
        let _ = self.inner.events.send(WatchEvent::DataChanged(path.to_string()));
        Ok(version)
    }

    async fn delete(
        &self,
        session: SessionId,
        path: &str,
        expected_version: Option<u64>,
    ) -> StoreResult<()> {
        self.check(session)?;
        {
            let mut nodes = self.inner.nodes.lock();
            let node = nodes
                .get(path)
                .ok_or_else(|| StoreError::NoNode(path.to_string()))?;
            if let Some(expected) = expected_version
                && expected != node.version
            {
                return Err(StoreError::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
            if !Inner::child_names(&nodes, path).is_empty() {
                return Err(StoreError::NotEmpty(path.to_string()));
            }
            nodes.remove(path);
        }
        let _ = self.inner.events.send(WatchEvent::Deleted(path.to_string()));
        Ok(())
    }

    async fn children(&self, session: SessionId, path: &str) -> StoreResult<Vec<String>> {
        self.check(session)?;
        let nodes = self.inner.nodes.lock();
        Ok(Inner::child_names(&nodes, path))
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.events.subscribe()
    }
}
