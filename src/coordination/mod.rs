//! Coordination Primitive Module
//!
//! Thin abstraction over an external hierarchical coordination service (ZooKeeper-like).
//! Everything above this layer only relies on the capabilities below, so any backend
//! offering them can carry the discovery protocol.
//!
//! ## Capabilities
//! - **Sessions**: every client opens a session that must be kept alive with heartbeats.
//!   When a session expires, the service deletes every ephemeral node it owns.
//! - **Hierarchical nodes**: persistent and ephemeral nodes with versioned data.
//! - **Sequence allocation**: `create_sequential` atomically allocates a per-parent,
//!   strictly increasing sequence number and embeds it in the node name.
//! - **Watches**: a change feed (`WatchEvent`) for creations, deletions, data changes
//!   and server-side session expiry.
//!
//! ## Submodules
//! - **`memory`**: In-process ensemble used by tests and the sandbox binary.
//! - **`client`**: Session wrapper with retry-on-disconnect and expiry detection.
//! - **`paths`**: The discovery layout on top of the hierarchy.

pub mod client;
pub mod memory;
pub mod paths;


pub use client::{CoordinationClient, SessionState};
pub use memory::MemoryEnsemble;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifier of a coordination session.
pub type SessionId = u64;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lifetime of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Deleted by the service when the owning session ends or expires.
    Ephemeral,
}

/// Node payload together with its modification counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub data: Vec<u8>,
    /// Incremented on every `set`; starts at 0.
    pub version: u64,
    /// Owning session for ephemeral nodes.
    pub owner: Option<SessionId>,
}

/// Change notification emitted by the service. Paths are absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    Deleted(String),
    DataChanged(String),
    SessionExpired(SessionId),
}

impl WatchEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            WatchEvent::Created(path)
            | WatchEvent::Deleted(path)
            | WatchEvent::DataChanged(path) => Some(path),
            WatchEvent::SessionExpired(_) => None,
        }
    }
}

/// Errors reported by a coordination backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The service could not be reached; the operation did not happen.
    #[error("connection to coordination service lost")]
    ConnectionLoss,
    #[error("coordination session {0} expired")]
    SessionExpired(SessionId),
    #[error("node already exists: {0}")]
    NodeExists(String),
    #[error("no such node: {0}")]
    NoNode(String),
    #[error("version conflict on {path} (expected {expected}, actual {actual})")]
    BadVersion {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("ephemeral node cannot have children: {0}")]
    NoChildrenForEphemerals(String),
    #[error("coordination client closed")]
    Closed,
    #[error("malformed coordination payload: {0}")]
    Codec(String),
}

impl StoreError {
    /// Errors after which the same call may simply be issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::ConnectionLoss)
    }

    pub fn is_session_loss(&self) -> bool {
        matches!(self, StoreError::SessionExpired(_) | StoreError::Closed)
    }
}

/// The capability set the discovery protocol consumes from the coordination service.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Opens a new session that expires after `timeout` without heartbeats.
    async fn open_session(&self, timeout: Duration) -> StoreResult<SessionId>;

    /// Keeps a session alive.
    async fn heartbeat(&self, session: SessionId) -> StoreResult<()>;

    /// Ends a session, deleting its ephemeral nodes.
    async fn close_session(&self, session: SessionId) -> StoreResult<()>;

    /// Creates `path`. The parent must exist.
    async fn create(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> StoreResult<()>;

    /// Creates `<parent>/<seq:010>` (or `<parent>/<seq:010>-<suffix>` when a suffix is
    /// given) with a sequence number unique under `parent`. Returns the node name.
    async fn create_sequential(
        &self,
        session: SessionId,
        parent: &str,
        suffix: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> StoreResult<String>;

    async fn get(&self, session: SessionId, path: &str) -> StoreResult<Option<Versioned>>;

    /// Replaces the data of `path`, optionally guarded by the expected version.
    async fn set(
        &self,
        session: SessionId,
        path: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> StoreResult<u64>;

    async fn delete(
        &self,
        session: SessionId,
        path: &str,
        expected_version: Option<u64>,
    ) -> StoreResult<()>;

    /// Sorted child names of `path`; empty when `path` does not exist.
    async fn children(&self, session: SessionId, path: &str) -> StoreResult<Vec<String>>;

    /// Subscribes to the change feed.
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Encodes a coordination payload.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Decodes a coordination payload.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}
