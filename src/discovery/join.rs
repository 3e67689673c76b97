//! Join Handshake
//!
//! A candidate opens a coordination session, registers its alive marker, writes
//! a request under `joined/<seq>` and waits for the coordinator to answer it in
//! place. The marker is created before the request, so the candidate takes part
//! in the election while it waits: the first server of an empty cluster answers
//! its own request.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::coordinator::{CoordinatorContext, CoordinatorHandle};
use super::journal::EventJournal;
use super::protocol::{JoinEntry, JoinRequest, JoinResponse};
use crate::config::DiscoveryConfig;
use crate::coordination::{
    self, CoordinationClient, CoordinationStore, CreateMode, StoreError, paths,
};
use crate::error::{DiscoveryError, Result};
use crate::membership::registry::MembershipRegistry;
use crate::membership::types::{AliveMarker, ClusterNode, NodeId};

/// One coordination session of a node, from registration until it is torn down.
pub struct Session {
    pub client: Arc<CoordinationClient>,
    pub registry: Arc<MembershipRegistry>,
    pub journal: Arc<EventJournal>,
    pub marker: AliveMarker,
    local: RwLock<Option<ClusterNode>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    coordinator: Mutex<Option<CoordinatorHandle>>,
    leaving: AtomicBool,
}

impl Session {
    /// Opens a session and registers the alive marker of `node_id`.
    pub async fn open(
        store: Arc<dyn CoordinationStore>,
        config: &DiscoveryConfig,
        node_id: &NodeId,
        client_mode: bool,
        deadline: Option<Instant>,
    ) -> Result<Arc<Self>> {
        let connect_limit = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let client = CoordinationClient::connect(
            store,
            &config.root_path,
            config.session_timeout,
            connect_limit,
        )
        .await
        .map_err(|e| match e {
            StoreError::ConnectionLoss => DiscoveryError::JoinTimeout(config.join_timeout),
            other => DiscoveryError::Coordination(other),
        })?;

        let registered = async {
            for dir in paths::ALL_DIRS {
                client.ensure_path(dir).await?;
            }
            let registry = Arc::new(MembershipRegistry::new(client.clone()));
            let marker = registry.register(node_id, client_mode).await?;
            Ok::<_, StoreError>((registry, marker))
        }
        .await;

        let (registry, marker) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                client.close().await;
                return Err(e.into());
            }
        };

        Ok(Arc::new(Self {
            journal: Arc::new(EventJournal::new(client.clone())),
            client,
            registry,
            marker,
            local: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
            coordinator: Mutex::new(None),
            leaving: AtomicBool::new(false),
        }))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.marker.node_id
    }

    /// Topology entry of this node, once accepted.
    pub fn local(&self) -> Option<ClusterNode> {
        self.local.read().clone()
    }

    pub fn set_local(&self, node: ClusterNode) {
        *self.local.write() = Some(node);
    }

    pub fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator
            .lock()
            .as_ref()
            .is_some_and(|handle| handle.is_running())
    }

    /// Starts the coordinator loop unless it already runs.
    pub fn ensure_coordinator(&self, ctx: impl FnOnce() -> CoordinatorContext) {
        let mut coordinator = self.coordinator.lock();
        if coordinator.as_ref().is_some_and(|handle| handle.is_running()) {
            return;
        }
        *coordinator = Some(CoordinatorHandle::spawn(ctx()));
    }

    pub fn mark_leaving(&self) {
        self.leaving.store(true, Ordering::SeqCst);
    }

    pub fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::SeqCst)
    }

    /// Stops every task of the session and closes it. The marker goes away with it.
    pub async fn shutdown(&self) {
        self.mark_leaving();
        if let Some(coordinator) = self.coordinator.lock().take() {
            coordinator.stop();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.client.close().await;
    }

    /// Writes a join request and returns its name under `joined/`.
    pub async fn submit(&self, request: JoinRequest) -> Result<String> {
        let entry = JoinEntry {
            request,
            response: None,
        };
        let name = self
            .client
            .create_sequential(paths::JOINED, "", coordination::encode(&entry)?, CreateMode::Persistent)
            .await?;
        tracing::debug!("Node {} submitted join request {}", self.node_id(), name);
        Ok(name)
    }

    /// Waits until the coordinator answers request `name`.
    ///
    /// # Arguments
    /// * `deadline` - When to give up; `None` waits forever.
    /// * `join_timeout` - Configured timeout, reported in the error.
    /// * `poll` - Re-check period in case a change notification was missed.
    /// * `stopped` - Set when the node is stopped; the wait ends with `Stopped`.
    pub async fn await_response(
        &self,
        name: &str,
        deadline: Option<Instant>,
        join_timeout: Duration,
        poll: Duration,
        stopped: &AtomicBool,
    ) -> Result<JoinResponse> {
        let path = paths::joined(name);
        let mut events = self.client.watch();
        let mut state = self.client.subscribe_state();

        loop {
            let Some(stored) = self.client.get(&path).await? else {
                // Dropped by the coordinator: our marker was gone when it looked
                return Err(StoreError::SessionExpired(self.client.session_id()).into());
            };
            let entry: JoinEntry = coordination::decode(&stored.data)?;
            if let Some(response) = entry.response {
                return Ok(response);
            }

            if self.client.state().is_terminal() {
                return Err(StoreError::SessionExpired(self.client.session_id()).into());
            }
            if stopped.load(Ordering::SeqCst) {
                return Err(DiscoveryError::Stopped);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        tracing::warn!(
                            "Node {} got no join response within {:?}",
                            self.node_id(),
                            join_timeout
                        );
                        return Err(DiscoveryError::JoinTimeout(join_timeout));
                    }
                    left.min(poll)
                }
                None => poll,
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = events.recv() => {}
                _ = state.changed() => {}
            }
        }
    }

    /// Removes what a failed join left behind and closes the session.
    pub async fn abandon(&self, request: Option<&str>) {
        if let Some(name) = request
            && let Err(e) = self.client.delete_if_exists(&paths::joined(name)).await
        {
            tracing::debug!("Could not delete join request {}: {}", name, e);
        }
        if let Err(e) = self.registry.remove(&self.marker).await {
            tracing::debug!("Could not delete marker {}: {}", self.marker.name, e);
        }
        self.shutdown().await;
    }
}
