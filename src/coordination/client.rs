//! Coordination Session Client
//!
//! Wraps one session on a `CoordinationStore` and scopes every path under a configurable
//! root. Operations that fail with `ConnectionLoss` are retried with exponential backoff
//! until they succeed or the session is deemed lost: either the service reported the
//! expiry, or no call reached the service for longer than the session timeout.
//!
//! The session state is published on a `watch` channel so the node runtime can react
//! to `Disconnected` and `Expired` transitions.

use super::{CoordinationStore, CreateMode, SessionId, StoreError, StoreResult, Versioned, WatchEvent};

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

const INITIAL_BACKOFF_MS: u64 = 150;
const MAX_BACKOFF_MS: u64 = 1200;
const CONNECT_BACKOFF_CAP_MS: u64 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    /// Calls currently fail with `ConnectionLoss`; the session may still recover.
    Disconnected,
    /// Terminal: ephemeral nodes of this session are gone.
    Expired,
    /// Terminal: closed locally.
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Expired | SessionState::Closed)
    }
}

pub struct CoordinationClient {
    store: Arc<dyn CoordinationStore>,
    root: String,
    session: SessionId,
    session_timeout: Duration,
    state_tx: watch::Sender<SessionState>,
    last_contact: Mutex<Instant>,
    heartbeat_handle: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationClient {
    /// Opens a session, creating the root path if it is missing, and starts heartbeating.
    ///
    /// # Arguments
    /// * `store` - The coordination backend.
    /// * `root` - Absolute root path every relative path is resolved against.
    /// * `session_timeout` - Heartbeat-less interval after which the session expires.
    /// * `deadline` - How long to keep retrying while the service is unreachable.
    ///   `None` retries forever.
    pub async fn connect(
        store: Arc<dyn CoordinationStore>,
        root: &str,
        session_timeout: Duration,
        deadline: Option<Duration>,
    ) -> StoreResult<Arc<Self>> {
        let started = Instant::now();
        let mut delay_ms = INITIAL_BACKOFF_MS;

        let session = loop {
            match store.open_session(session_timeout).await {
                Ok(session) => break session,
                Err(e) if e.is_retryable() => {
                    if let Some(limit) = deadline
                        && started.elapsed() >= limit
                    {
                        tracing::warn!("Coordination service unreachable for {:?}", limit);
                        return Err(e);
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(CONNECT_BACKOFF_CAP_MS);
                }
                Err(e) => return Err(e),
            }
        };

        let (state_tx, _) = watch::channel(SessionState::Connected);
        let client = Arc::new(Self {
            store,
            root: normalize_root(root),
            session,
            session_timeout,
            state_tx,
            last_contact: Mutex::new(Instant::now()),
            heartbeat_handle: Mutex::new(None),
        });

        let handle = {
            let client = client.clone();
            tokio::spawn(async move {
                client.heartbeat_loop().await;
            })
        };
        *client.heartbeat_handle.lock() = Some(handle);

        if let Err(e) = client.ensure_root().await {
            client.close().await;
            return Err(e);
        }

        tracing::info!("Opened coordination session {} under {}", session, client.root);
        Ok(client)
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Raw change feed of the backend. Paths are absolute; see [`Self::relative`].
    pub fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.store.subscribe()
    }

    /// Resolves a path relative to the root.
    pub fn absolute(&self, relative: &str) -> String {
        if relative.is_empty() {
            self.root.clone()
        } else if self.root == "/" {
            format!("/{}", relative)
        } else {
            format!("{}/{}", self.root, relative)
        }
    }

    /// Strips the root from an absolute path, if it lies under it.
    pub fn relative<'a>(&self, absolute: &'a str) -> Option<&'a str> {
        if self.root == "/" {
            return absolute.strip_prefix('/');
        }
        absolute
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Creates every missing component of `relative` as a persistent node.
    pub async fn ensure_path(&self, relative: &str) -> StoreResult<()> {
        let mut current = String::new();
        for part in relative.split('/').filter(|p| !p.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            match self.create(&current, Vec::new(), CreateMode::Persistent).await {
                Ok(()) | Err(StoreError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub async fn create(&self, relative: &str, data: Vec<u8>, mode: CreateMode) -> StoreResult<()> {
        let path = self.absolute(relative);
        self.retry(|| self.store.create(self.session, &path, data.clone(), mode))
            .await
    }

    /// Creates a sequential child of `parent` and returns its name (not its path).
    pub async fn create_sequential(
        &self,
        parent: &str,
        suffix: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> StoreResult<String> {
        let path = self.absolute(parent);
        self.retry(|| {
            self.store
                .create_sequential(self.session, &path, suffix, data.clone(), mode)
        })
        .await
    }

    pub async fn get(&self, relative: &str) -> StoreResult<Option<Versioned>> {
        let path = self.absolute(relative);
        self.retry(|| self.store.get(self.session, &path)).await
    }

    pub async fn exists(&self, relative: &str) -> StoreResult<bool> {
        Ok(self.get(relative).await?.is_some())
    }

    pub async fn set(
        &self,
        relative: &str,
        data: Vec<u8>,
        expected_version: Option<u64>,
    ) -> StoreResult<u64> {
        let path = self.absolute(relative);
        self.retry(|| {
            self.store
                .set(self.session, &path, data.clone(), expected_version)
        })
        .await
    }

    pub async fn delete(&self, relative: &str, expected_version: Option<u64>) -> StoreResult<()> {
        let path = self.absolute(relative);
        self.retry(|| self.store.delete(self.session, &path, expected_version))
            .await
    }

    /// Deletes `relative` if present. Returns whether this call removed it.
    pub async fn delete_if_exists(&self, relative: &str) -> StoreResult<bool> {
        match self.delete(relative, None).await {
            Ok(()) => Ok(true),
            Err(StoreError::NoNode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Deletes `relative` and everything below it.
    pub async fn delete_recursive(&self, relative: &str) -> StoreResult<()> {
        let mut stack = vec![relative.to_string()];
        let mut ordered = Vec::new();
        while let Some(path) = stack.pop() {
            for child in self.children(&path).await? {
                stack.push(format!("{}/{}", path, child));
            }
            ordered.push(path);
        }
        for path in ordered.into_iter().rev() {
            self.delete_if_exists(&path).await?;
        }
        Ok(())
    }

    pub async fn children(&self, relative: &str) -> StoreResult<Vec<String>> {
        let path = self.absolute(relative);
        self.retry(|| self.store.children(self.session, &path)).await
    }

    /// Stops heartbeating and closes the session. Ephemeral nodes go away with it.
    pub async fn close(&self) {
        if let Some(handle) = self.heartbeat_handle.lock().take() {
            handle.abort();
        }
        if self.state().is_terminal() {
            return;
        }
        if let Err(e) = self.store.close_session(self.session).await {
            tracing::debug!("Closing session {} failed: {}", self.session, e);
        }
        self.publish(SessionState::Closed);
        tracing::info!("Closed coordination session {}", self.session);
    }

    async fn ensure_root(&self) -> StoreResult<()> {
        let mut current = String::new();
        for part in self.root.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            let path = current.clone();
            match self
                .retry(|| {
                    self.store
                        .create(self.session, &path, Vec::new(), CreateMode::Persistent)
                })
                .await
            {
                Ok(()) | Err(StoreError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn retry<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut delay_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.state() {
                SessionState::Expired => return Err(StoreError::SessionExpired(self.session)),
                SessionState::Closed => return Err(StoreError::Closed),
                _ => {}
            }

            match op().await {
                Ok(value) => {
                    self.mark_contact();
                    return Ok(value);
                }
                Err(StoreError::ConnectionLoss) => {
                    if self.connection_lost_too_long() {
                        return Err(StoreError::SessionExpired(self.session));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(MAX_BACKOFF_MS);
                }
                Err(e @ StoreError::SessionExpired(_)) => {
                    self.publish(SessionState::Expired);
                    return Err(e);
                }
                Err(e) => {
                    self.mark_contact();
                    return Err(e);
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let period = (self.session_timeout / 3).max(Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);

        loop {
            interval.tick().await;

            match self.store.heartbeat(self.session).await {
                Ok(()) => self.mark_contact(),
                Err(StoreError::ConnectionLoss) => {
                    if self.connection_lost_too_long() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Session {} heartbeat failed: {}", self.session, e);
                    self.publish(SessionState::Expired);
                    break;
                }
            }
        }
    }

    fn mark_contact(&self) {
        *self.last_contact.lock() = Instant::now();
        self.publish(SessionState::Connected);
    }

    /// Records a failed contact. Returns true once the session must be considered expired.
    fn connection_lost_too_long(&self) -> bool {
        let silent_for = self.last_contact.lock().elapsed();
        if silent_for > self.session_timeout {
            tracing::warn!(
                "Session {} lost contact for {:?}, treating it as expired",
                self.session,
                silent_for
            );
            self.publish(SessionState::Expired);
            true
        } else {
            self.publish(SessionState::Disconnected);
            false
        }
    }

    fn publish(&self, next: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            tracing::debug!("Session {} state {:?} -> {:?}", self.session, *state, next);
            *state = next;
            true
        });
    }
}

fn normalize_root(root: &str) -> String {
    let trimmed = root.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
