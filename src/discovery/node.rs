//! Discovery Node
//!
//! Public face of the discovery layer. A `DiscoveryNode` joins the cluster through
//! the coordination service, keeps a local copy of the topology by applying the
//! event journal in version order, acknowledges what it applied, and runs the
//! coordinator loop whenever it is the alive server with the lowest order.
//!
//! ## Session runtime
//! Every coordination session gets one watcher task. On each change notification
//! (and on a periodic tick) it:
//! 1. Runs the election and starts the coordinator if this node won it.
//! 2. Applies new journal entries and notifies listeners.
//! 3. Flushes acknowledgments once `ack_threshold` events are pending or the
//!    oldest pending one waited `ack_flush_interval`.
//! 4. Answers connectivity checks of resolution rounds it takes part in.
//! 5. Detects loss of its place in the cluster.
//!
//! Losing the session, being evicted, or (for clients) seeing every server leave
//! is fed to the [`ReconnectStateMachine`]: servers segment and stop, clients
//! rejoin under a fresh node id.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::coordinator::CoordinatorContext;
use super::join::Session;
use super::journal::JournalEntry;
use super::listeners::{ListenerRegistry, SubscriptionId};
use super::protocol::{
    ConnectivityReport, CoordinatorRequest, CustomMessage, JoinRejection, JoinRequest,
    JoinResponse, ResolutionOutcome, ResolveRound,
};
use super::topology::LocalTopology;
use super::types::{DiscoveryEvent, EventMask, EventType, TopologySnapshot};
use crate::config::DiscoveryConfig;
use crate::coordination::{
    self, CoordinationStore, CreateMode, SessionId, SessionState, StoreError, StoreResult, paths,
};
use crate::error::{DiscoveryError, Result};
use crate::membership::registry::MembershipRegistry;
use crate::membership::types::{ClusterNode, NodeId};
use crate::reconnect::{ClientConnectionState, DisconnectCause, ReconnectAction, ReconnectStateMachine};
use crate::resolver::ResolverKind;
use crate::security::{AllowAll, Authenticator, Credentials};
use crate::transport::{MessageHandlerFn, Transport, message_handler};

const RECONNECT_INITIAL_BACKOFF_MS: u64 = 150;
const RECONNECT_MAX_BACKOFF_MS: u64 = 1200;

/// Static description of a node: identity, role, credentials and configuration.
#[derive(Clone)]
pub struct NodeSpec {
    pub node_id: NodeId,
    /// Defaults to the node id string.
    pub consistent_id: Option<String>,
    pub client: bool,
    pub attributes: BTreeMap<String, String>,
    pub credentials: Credentials,
    pub config: DiscoveryConfig,
    pub resolver: ResolverKind,
    pub authenticator: Arc<dyn Authenticator>,
}

impl NodeSpec {
    pub fn server(config: DiscoveryConfig) -> Self {
        Self::new(config, false)
    }

    pub fn client(config: DiscoveryConfig) -> Self {
        Self::new(config, true)
    }

    fn new(config: DiscoveryConfig, client: bool) -> Self {
        Self {
            node_id: NodeId::new(),
            consistent_id: None,
            client,
            attributes: BTreeMap::new(),
            credentials: Credentials::default(),
            resolver: ResolverKind::from(&config.resolver),
            config,
            authenticator: Arc::new(AllowAll),
        }
    }

    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_consistent_id(mut self, consistent_id: &str) -> Self {
        self.consistent_id = Some(consistent_id.to_string());
        self
    }

    pub fn with_attribute(mut self, key: &str, value: &str) -> Self {
        self.attributes.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_resolver(mut self, resolver: ResolverKind) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_authenticator<A: Authenticator>(mut self, authenticator: A) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }
}

/// Pending acknowledgments of one session.
struct AckState {
    unacked: usize,
    oldest_unacked: Option<Instant>,
}

pub struct DiscoveryNode {
    spec: NodeSpec,
    store: Arc<dyn CoordinationStore>,
    transport: Arc<dyn Transport>,
    listeners: Arc<ListenerRegistry>,
    topology: Arc<LocalTopology>,
    machine: Mutex<ReconnectStateMachine>,
    state_tx: watch::Sender<ClientConnectionState>,
    session: Mutex<Option<Arc<Session>>>,
    message_handler: RwLock<Option<MessageHandlerFn>>,
    loss_task: Mutex<Option<JoinHandle<()>>>,
    /// Held by `join` and by reconnects, so only one join handshake runs at a time.
    joining: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
}

impl DiscoveryNode {
    pub fn new(
        spec: NodeSpec,
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ClientConnectionState::Connected);
        Arc::new(Self {
            machine: Mutex::new(ReconnectStateMachine::new(
                spec.client,
                spec.config.client_reconnect_disabled,
            )),
            topology: Arc::new(LocalTopology::new(spec.config.event_history_limit)),
            listeners: ListenerRegistry::new(),
            state_tx,
            session: Mutex::new(None),
            message_handler: RwLock::new(None),
            loss_task: Mutex::new(None),
            joining: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
            spec,
            store,
            transport,
        })
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    /// Joins the cluster and returns once the coordinator accepted this node.
    ///
    /// A call made while another join (or a reconnect) is in flight waits for it
    /// and returns `Ok` only if that attempt got the node accepted.
    ///
    /// # Errors
    /// * `AuthenticationFailed` / `DuplicateNodeId` when the coordinator rejected the node.
    /// * `JoinTimeout` when no coordinator answered within `join_timeout`.
    pub async fn join(self: &Arc<Self>) -> Result<()> {
        let _joining = self.joining.lock().await;
        if self.is_stopped() {
            return Err(DiscoveryError::Stopped);
        }
        if self.local_node().is_some() {
            return Ok(());
        }
        if !self.spec.node_id.is_valid() {
            return Err(DiscoveryError::InvalidNodeId(self.spec.node_id.clone()));
        }
        self.spec.config.validate()?;

        let deadline = self
            .spec
            .config
            .join_deadline()
            .map(|timeout| Instant::now() + timeout);
        let node = self.join_as(self.spec.node_id.clone(), None, deadline).await?;

        tracing::info!(
            "Node {} joined the cluster with order {} (topology version {})",
            node.id,
            node.order,
            self.topology.version()
        );
        self.state_tx.send_replace(ClientConnectionState::Connected);
        Ok(())
    }

    /// Leaves the cluster. Other nodes observe `NodeLeft`. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // A reconnect in flight sees the flag and closes the session it opened
        let loss_task = self.loss_task.lock().take();
        if let Some(mut task) = loss_task
            && tokio::time::timeout(self.spec.config.session_timeout, &mut task)
                .await
                .is_err()
        {
            tracing::warn!("Reconnect of {} did not wind down, aborting it", self.spec.node_id);
            task.abort();
        }

        let session = self.session.lock().take();
        let Some(session) = session else {
            return Ok(());
        };
        session.mark_leaving();

        if let Some(local) = session.local() {
            let request = CoordinatorRequest::Leave {
                node_id: local.id.clone(),
            };
            if let Err(e) = self.submit_request(&session, &request).await {
                tracing::warn!("Node {} could not announce its departure: {}", local.id, e);
            }
        }
        if let Err(e) = session.registry.remove(&session.marker).await {
            tracing::debug!("Node {} could not delete its marker: {}", session.node_id(), e);
        }
        self.transport.unbind(session.node_id()).await;
        session.shutdown().await;

        tracing::info!("Node {} stopped", session.node_id());
        Ok(())
    }

    /// Makes a connected client drop its session and rejoin. Returns once the client
    /// is connected again.
    pub async fn client_reconnect(self: &Arc<Self>) -> Result<()> {
        if !self.spec.client {
            return Err(DiscoveryError::Config(
                "client_reconnect is only available on client nodes".to_string(),
            ));
        }
        let (session, _) = self.joined_session()?;
        self.clone()
            .handle_loss(session, DisconnectCause::Forced)
            .await;

        if self.state().is_connected() {
            Ok(())
        } else {
            Err(DiscoveryError::Segmented)
        }
    }

    // ============================================================
    // QUERIES
    // ============================================================

    /// Id currently used in the topology. Changes when a client reconnects.
    pub fn id(&self) -> NodeId {
        match self.session.lock().as_ref() {
            Some(session) => session.node_id().clone(),
            None => self.spec.node_id.clone(),
        }
    }

    pub fn consistent_id(&self) -> String {
        self.spec
            .consistent_id
            .clone()
            .unwrap_or_else(|| self.spec.node_id.to_string())
    }

    pub fn is_client(&self) -> bool {
        self.spec.client
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.spec.config
    }

    pub fn local_node(&self) -> Option<ClusterNode> {
        self.session.lock().as_ref().and_then(|session| session.local())
    }

    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.topology.snapshot()
    }

    pub fn topology_version(&self) -> u64 {
        self.topology.version()
    }

    /// Recent discovery events, oldest first.
    pub fn history(&self) -> Vec<DiscoveryEvent> {
        self.topology.history()
    }

    pub fn state(&self) -> ClientConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether this node currently runs the coordinator loop.
    pub fn is_coordinator(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|session| session.is_coordinator())
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.client.session_id())
    }

    /// Journal entries not yet collected.
    pub async fn retained_journal_len(&self) -> Result<usize> {
        let (session, _) = self.joined_session()?;
        Ok(session.journal.retained_count().await?)
    }

    /// Whether `id` is in the topology, holds its alive marker and answers a ping.
    pub async fn ping_node(&self, id: &NodeId) -> bool {
        let Ok((session, local)) = self.joined_session() else {
            return false;
        };
        let snapshot = self.topology.snapshot();
        let Some(node) = snapshot.node(id) else {
            return false;
        };

        let marker = paths::alive_name(node.internal_order, &node.id);
        match session.registry.marker_exists(&marker).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::debug!("Ping of {} could not read its marker: {}", id, e);
                return false;
            }
        }
        if node.id == local.id {
            return true;
        }
        self.transport
            .ping(&local.id, node, self.spec.config.ping_timeout)
            .await
    }

    // ============================================================
    // LISTENERS & MESSAGING
    // ============================================================

    pub fn local_listen<F>(&self, mask: EventMask, handler: F) -> SubscriptionId
    where
        F: Fn(&DiscoveryEvent) + Send + Sync + 'static,
    {
        self.listeners.register(mask, handler)
    }

    pub fn stop_local_listen(&self, id: SubscriptionId) -> bool {
        self.listeners.unregister(id)
    }

    /// Installs the handler for direct messages from other nodes.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(NodeId, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        *self.message_handler.write() = Some(message_handler(handler));
    }

    pub async fn send(&self, to: &NodeId, payload: Vec<u8>) -> Result<()> {
        let (_, local) = self.joined_session()?;
        let snapshot = self.topology.snapshot();
        let node = snapshot
            .node(to)
            .ok_or_else(|| DiscoveryError::UnknownNode(to.clone()))?;
        self.transport
            .send(&local.id, node, payload)
            .await
            .map_err(|e| DiscoveryError::Transport(format!("{:#}", e)))
    }

    /// Sends `payload` to every other node, reporting per-node results.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<Vec<(NodeId, anyhow::Result<()>)>> {
        let (_, local) = self.joined_session()?;
        let others: Vec<ClusterNode> = self
            .topology
            .snapshot()
            .nodes
            .iter()
            .filter(|node| node.id != local.id)
            .cloned()
            .collect();
        Ok(self.transport.broadcast(&local.id, &others, payload).await)
    }

    /// Publishes a custom event. Every node, the sender included, receives it with
    /// its own topology version.
    pub async fn send_custom(&self, payload: Vec<u8>) -> Result<()> {
        let (session, local) = self.joined_session()?;
        let message = CustomMessage {
            sender: local.id,
            payload,
        };
        session
            .client
            .create_sequential(
                paths::CUSTOM,
                "",
                coordination::encode(&message)?,
                CreateMode::Persistent,
            )
            .await?;
        Ok(())
    }

    // ============================================================
    // FAILURE HANDLING
    // ============================================================

    /// Asks the coordinator to evict `id` and waits until it left the local topology.
    pub async fn fail_node(&self, id: &NodeId, reason: &str) -> Result<()> {
        let (session, local) = self.joined_session()?;
        if !self.topology.snapshot().contains(id) {
            return Err(DiscoveryError::UnknownNode(id.clone()));
        }

        let request = CoordinatorRequest::ForceFail {
            node_id: id.clone(),
            requested_by: local.id.clone(),
            reason: reason.to_string(),
        };
        self.submit_request(&session, &request).await?;
        tracing::info!("Node {} requested failure of {}: {}", local.id, id, reason);

        if *id == local.id {
            return Ok(());
        }
        self.wait_for_topology(|topology| !topology.contains(id)).await
    }

    /// Runs a communication problem resolution for the link to `target`.
    ///
    /// Every node checks its connectivity to every other node, the configured
    /// resolver decides which nodes to kill, and the coordinator evicts them.
    ///
    /// # Errors
    /// * `CommunicationResolution(TopologyChanged)` when `target` is gone afterwards
    ///   (or already was).
    /// * `CommunicationResolution(Resolver)` when the resolver failed.
    /// * `CommunicationResolution(Segmented)` when this node was killed or lost the cluster.
    pub async fn resolve_communication_error(&self, target: &NodeId) -> Result<()> {
        let wrap = |cause: DiscoveryError| DiscoveryError::CommunicationResolution(Box::new(cause));

        let (session, local) = self.joined_session()?;
        if !self.topology.snapshot().contains(target) {
            return Err(wrap(DiscoveryError::TopologyChanged(format!(
                "node {} is not in the topology",
                target
            ))));
        }

        let request = CoordinatorRequest::Resolve {
            initiator: local.id.clone(),
            target: target.clone(),
            outcome: None,
        };
        let name = self.submit_request(&session, &request).await?;
        tracing::info!("Node {} started resolution for {} ({})", local.id, target, name);

        let outcome = self.await_outcome(&session, &name).await.map_err(wrap)?;
        if let Err(e) = session.client.delete_if_exists(&paths::request(&name)).await {
            tracing::debug!("Could not delete resolution request {}: {}", name, e);
        }

        match outcome {
            ResolutionOutcome::Failed(message) => Err(wrap(DiscoveryError::Resolver(message))),
            ResolutionOutcome::Completed { killed } => {
                if killed.contains(&local.id) {
                    return Err(wrap(DiscoveryError::Segmented));
                }
                self.wait_for_topology(|topology| killed.iter().all(|id| !topology.contains(id)))
                    .await
                    .map_err(wrap)?;
                if self.topology.snapshot().contains(target) {
                    Ok(())
                } else {
                    Err(wrap(DiscoveryError::TopologyChanged(format!(
                        "node {} left the topology",
                        target
                    ))))
                }
            }
        }
    }

    async fn await_outcome(&self, session: &Session, name: &str) -> Result<ResolutionOutcome> {
        let path = paths::request(name);
        let mut events = session.client.watch();

        loop {
            let Some(stored) = session.client.get(&path).await? else {
                // Dropped because we are no longer a member
                return Err(DiscoveryError::Segmented);
            };
            if let CoordinatorRequest::Resolve {
                outcome: Some(outcome),
                ..
            } = coordination::decode::<CoordinatorRequest>(&stored.data)?
            {
                return Ok(outcome);
            }
            if self.is_stopped() || !self.state().is_connected() {
                return Err(DiscoveryError::Segmented);
            }

            tokio::select! {
                _ = tokio::time::sleep(self.spec.config.coordinator_tick) => {}
                _ = events.recv() => {}
            }
        }
    }

    async fn wait_for_topology<P>(&self, predicate: P) -> Result<()>
    where
        P: Fn(&TopologySnapshot) -> bool,
    {
        let mut versions = self.topology.subscribe();
        loop {
            if predicate(&self.topology.snapshot()) {
                return Ok(());
            }
            if self.is_stopped() {
                return Err(DiscoveryError::Stopped);
            }
            if !self.state().is_connected() {
                return Err(DiscoveryError::Segmented);
            }
            tokio::select! {
                _ = versions.changed() => {}
                _ = tokio::time::sleep(self.spec.config.coordinator_tick) => {}
            }
        }
    }

    async fn submit_request(&self, session: &Session, request: &CoordinatorRequest) -> Result<String> {
        let name = session
            .client
            .create_sequential(
                paths::REQUESTS,
                "",
                coordination::encode(request)?,
                CreateMode::Persistent,
            )
            .await?;
        Ok(name)
    }

    fn joined_session(&self) -> Result<(Arc<Session>, ClusterNode)> {
        if self.is_stopped() {
            return Err(DiscoveryError::Stopped);
        }
        let session = self.session.lock().clone().ok_or(DiscoveryError::NotJoined)?;
        let local = session.local().ok_or(DiscoveryError::NotJoined)?;
        Ok((session, local))
    }

    // ============================================================
    // JOIN
    // ============================================================

    /// Opens a session under `node_id` and runs the join handshake.
    async fn join_as(
        self: &Arc<Self>,
        node_id: NodeId,
        previous: Option<(NodeId, u64)>,
        deadline: Option<Instant>,
    ) -> Result<ClusterNode> {
        let config = &self.spec.config;
        let session = Session::open(
            self.store.clone(),
            config,
            &node_id,
            self.spec.client,
            deadline,
        )
        .await?;
        if self.is_stopped() {
            session.abandon(None).await;
            return Err(DiscoveryError::Stopped);
        }

        let mut attributes = self.spec.attributes.clone();
        match self.transport.bind(&node_id, self.dispatcher()).await {
            Ok(bound) => attributes.extend(bound),
            Err(e) => {
                let taken = self.id_taken(&session, &node_id).await;
                session.abandon(None).await;
                if taken {
                    tracing::warn!("Join of {} refused: the id is bound by a live node", node_id);
                    return Err(DiscoveryError::DuplicateNodeId(node_id));
                }
                return Err(DiscoveryError::Transport(format!("{:#}", e)));
            }
        }

        // Checked under the lock `stop` takes the session with
        let installed = {
            let mut current = self.session.lock();
            if self.is_stopped() {
                false
            } else {
                *current = Some(session.clone());
                true
            }
        };
        if !installed {
            self.transport.unbind(&node_id).await;
            session.abandon(None).await;
            return Err(DiscoveryError::Stopped);
        }
        let watcher = {
            let node = self.clone();
            let session = session.clone();
            tokio::spawn(async move {
                node.run_session(session).await;
            })
        };
        session.track(watcher);

        let (previous_id, last_version) = match previous {
            Some((id, version)) => (Some(id), Some(version)),
            None => (None, None),
        };
        let request = JoinRequest {
            node_id: node_id.clone(),
            consistent_id: self.consistent_id(),
            attributes,
            client: self.spec.client,
            credentials: self.spec.credentials.clone(),
            marker_name: session.marker.name.clone(),
            marker_seq: session.marker.seq,
            previous_id,
            last_version,
        };

        let name = match session.submit(request).await {
            Ok(name) => name,
            Err(e) => {
                self.discard(&session, None).await;
                return Err(e);
            }
        };
        let response = match session
            .await_response(
                &name,
                deadline,
                config.join_timeout,
                config.coordinator_tick,
                &self.stopped,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.discard(&session, Some(&name)).await;
                return Err(if self.is_stopped() {
                    DiscoveryError::Stopped
                } else {
                    e
                });
            }
        };

        match response {
            JoinResponse::Accepted {
                node,
                snapshot,
                missed,
            } => {
                if let Err(e) = session.client.delete_if_exists(&paths::joined(&name)).await {
                    tracing::debug!("Could not delete answered join request {}: {}", name, e);
                }
                self.install_topology(&node, snapshot, missed);
                session.set_local(node.clone());
                if let Err(e) = session
                    .registry
                    .update_ack(&session.marker, self.topology.version())
                    .await
                {
                    tracing::debug!("Initial ack of {} failed: {}", node.id, e);
                }
                Ok(node)
            }
            JoinResponse::Rejected(rejection) => {
                self.discard(&session, Some(&name)).await;
                Err(match rejection {
                    JoinRejection::Authentication(reason) => {
                        tracing::warn!("Join of {} rejected: {}", node_id, reason);
                        DiscoveryError::AuthenticationFailed(reason)
                    }
                    JoinRejection::DuplicateId => {
                        tracing::warn!("Join of {} rejected: duplicate node id", node_id);
                        DiscoveryError::DuplicateNodeId(node_id)
                    }
                })
            }
        }
    }

    /// Whether another live session holds an alive marker for `node_id`.
    async fn id_taken(&self, session: &Session, node_id: &NodeId) -> bool {
        match session.registry.alive_markers().await {
            Ok(markers) => markers
                .iter()
                .any(|m| &m.node_id == node_id && m.name != session.marker.name),
            Err(e) => {
                tracing::debug!("Could not list markers while checking {}: {}", node_id, e);
                false
            }
        }
    }

    /// Applies the delta a reconnecting client missed, or replaces the topology.
    fn install_topology(
        &self,
        node: &ClusterNode,
        snapshot: TopologySnapshot,
        missed: Option<Vec<JournalEntry>>,
    ) {
        let next = self.topology.version() + 1;
        match missed {
            Some(entries) if entries.first().is_some_and(|entry| entry.version == next) => {
                tracing::debug!("Node {} replays {} missed events", node.id, entries.len());
                for entry in entries {
                    let own_join = entry.event_type == EventType::NodeJoined && entry.node.id == node.id;
                    for event in self.topology.offer(entry) {
                        if !own_join {
                            self.listeners.notify(&event);
                        }
                    }
                }
            }
            _ => self.topology.reset(snapshot),
        }
    }

    async fn discard(&self, session: &Arc<Session>, request: Option<&str>) {
        self.release(session);
        self.transport.unbind(session.node_id()).await;
        session.abandon(request).await;
    }

    /// Forgets `session` if it is the current one.
    fn release(&self, session: &Arc<Session>) {
        let mut current = self.session.lock();
        if current
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, session))
        {
            *current = None;
        }
    }

    fn dispatcher(self: &Arc<Self>) -> MessageHandlerFn {
        let node = Arc::downgrade(self);
        message_handler(move |from: NodeId, payload: Vec<u8>| {
            let handler = node
                .upgrade()
                .and_then(|node| node.message_handler.read().clone());
            async move {
                match handler {
                    Some(handler) => handler(from, payload).await,
                    None => {
                        tracing::debug!("Dropping message from {}: no handler installed", from);
                        Ok(())
                    }
                }
            }
        })
    }

    // ============================================================
    // SESSION RUNTIME
    // ============================================================

    async fn run_session(self: Arc<Self>, session: Arc<Session>) {
        let mut events = session.client.watch();
        let mut session_state = session.client.subscribe_state();
        let mut tick = tokio::time::interval(self.spec.config.coordinator_tick);
        let mut acks = AckState {
            unacked: 0,
            oldest_unacked: None,
        };
        let mut rounds = HashSet::new();

        loop {
            let joined = session.local().is_some();
            if session.is_leaving() {
                return;
            }
            if joined && session.client.state() == SessionState::Expired {
                self.spawn_loss(session, DisconnectCause::SessionExpired);
                return;
            }

            match self.session_step(&session, &mut acks, &mut rounds).await {
                Ok(None) => {}
                Ok(Some(cause)) => {
                    if !session.is_leaving() {
                        self.spawn_loss(session, cause);
                    }
                    return;
                }
                Err(e) if e.is_session_loss() => {
                    if joined && !session.is_leaving() {
                        self.spawn_loss(session, DisconnectCause::SessionExpired);
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!("Node {} watcher step failed: {}", session.node_id(), e);
                }
            }

            tokio::select! {
                _ = tick.tick() => {}
                _ = session_state.changed() => {}
                received = events.recv() => {
                    if received.is_ok() {
                        while events.try_recv().is_ok() {}
                    }
                }
            }
        }
    }

    async fn session_step(
        &self,
        session: &Session,
        acks: &mut AckState,
        rounds: &mut HashSet<u64>,
    ) -> StoreResult<Option<DisconnectCause>> {
        let markers = session.registry.alive_markers().await?;
        let own_alive = markers.iter().any(|m| m.name == session.marker.name);

        if !self.spec.client {
            let members = session
                .journal
                .tail()
                .await?
                .map(|entry| entry.nodes)
                .unwrap_or_default();
            if MembershipRegistry::coordinator(&markers, &members)
                .is_some_and(|m| m.name == session.marker.name)
            {
                session.ensure_coordinator(|| self.coordinator_context(session));
            }
        }

        let Some(local) = session.local() else {
            return Ok(None);
        };

        if let Some(cause) = self.apply_journal(session, &local, acks).await? {
            return Ok(Some(cause));
        }
        if !own_alive {
            tracing::warn!("Node {} lost its alive marker", local.id);
            return Ok(Some(DisconnectCause::ForcedFail));
        }
        if local.client && !MembershipRegistry::has_servers(&markers) {
            tracing::warn!("Client {} sees no alive server", local.id);
            return Ok(Some(DisconnectCause::ServersLeft));
        }

        self.flush_acks(session, acks).await?;
        self.report_connectivity(session, &local, rounds).await?;
        Ok(None)
    }

    async fn apply_journal(
        &self,
        session: &Session,
        local: &ClusterNode,
        acks: &mut AckState,
    ) -> StoreResult<Option<DisconnectCause>> {
        let applied = self.topology.version();
        let entries = session.journal.read_from(applied).await?;

        if let Some(first) = entries.first()
            && first.version > applied + 1
        {
            // Only entries a member never acknowledged can be missing
            tracing::warn!(
                "Node {} missed journal versions {}..{}",
                local.id,
                applied + 1,
                first.version
            );
            return Ok(Some(DisconnectCause::ForcedFail));
        }

        for entry in entries {
            if entry.departed() == Some(&local.id) {
                tracing::warn!(
                    "Node {} was removed from the topology at version {}",
                    local.id,
                    entry.version
                );
                return Ok(Some(DisconnectCause::ForcedFail));
            }
            for event in self.topology.offer(entry) {
                tracing::trace!("Node {} applied {}", local.id, event);
                self.listeners.notify(&event);
                acks.unacked += 1;
                acks.oldest_unacked.get_or_insert_with(Instant::now);
            }
        }
        Ok(None)
    }

    async fn flush_acks(&self, session: &Session, acks: &mut AckState) -> StoreResult<()> {
        let Some(oldest) = acks.oldest_unacked else {
            return Ok(());
        };
        let config = &self.spec.config;
        if acks.unacked < config.ack_threshold && oldest.elapsed() < config.ack_flush_interval {
            return Ok(());
        }

        match session
            .registry
            .update_ack(&session.marker, self.topology.version())
            .await
        {
            Ok(()) | Err(StoreError::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
        acks.unacked = 0;
        acks.oldest_unacked = None;
        Ok(())
    }

    /// Starts a connectivity check for every new round this node takes part in.
    async fn report_connectivity(
        &self,
        session: &Session,
        local: &ClusterNode,
        rounds: &mut HashSet<u64>,
    ) -> StoreResult<()> {
        let listed: Vec<u64> = session
            .client
            .children(paths::RESOLVE)
            .await?
            .iter()
            .filter_map(|name| paths::parse_sequence(name))
            .collect();
        rounds.retain(|round| listed.contains(round));

        for round in listed {
            if !rounds.insert(round) {
                continue;
            }
            let Some(stored) = session.client.get(&paths::resolve_round(round)).await? else {
                continue;
            };
            let info: ResolveRound = coordination::decode(&stored.data)?;
            if !info.participants.iter().any(|p| p.id == local.id) {
                continue;
            }

            let transport = self.transport.clone();
            let client = session.client.clone();
            let local_id = local.id.clone();
            let timeout = self.spec.config.ping_timeout;
            session.track(tokio::spawn(async move {
                let reachable = transport
                    .check_connection(&local_id, &info.participants, timeout)
                    .await;
                tracing::debug!(
                    "Node {} reaches {}/{} nodes in round {}",
                    local_id,
                    reachable.count_ones(),
                    reachable.len(),
                    round
                );
                let report = ConnectivityReport {
                    reporter: local_id.clone(),
                    reachable,
                };
                let written = match coordination::encode(&report) {
                    Ok(data) => {
                        client
                            .create(&paths::resolve_report(round, &local_id), data, CreateMode::Persistent)
                            .await
                    }
                    Err(e) => Err(e),
                };
                match written {
                    // Round already completed
                    Ok(()) | Err(StoreError::NoNode(_)) | Err(StoreError::NodeExists(_)) => {}
                    Err(e) => tracing::warn!("Node {} could not report round {}: {}", local_id, round, e),
                }
            }));
        }
        Ok(())
    }

    fn coordinator_context(&self, session: &Session) -> CoordinatorContext {
        CoordinatorContext {
            client: session.client.clone(),
            registry: session.registry.clone(),
            journal: session.journal.clone(),
            local_id: session.node_id().clone(),
            local_marker: session.marker.name.clone(),
            authenticator: self.spec.authenticator.clone(),
            resolver: self.spec.resolver.resolver(),
            config: self.spec.config.clone(),
        }
    }

    // ============================================================
    // CONNECTION LOSS & RECONNECT
    // ============================================================

    fn spawn_loss(self: &Arc<Self>, session: Arc<Session>, cause: DisconnectCause) {
        let node = self.clone();
        let handle = tokio::spawn(async move {
            node.handle_loss(session, cause).await;
        });
        *self.loss_task.lock() = Some(handle);
    }

    async fn handle_loss(self: Arc<Self>, session: Arc<Session>, cause: DisconnectCause) {
        let current = self
            .session
            .lock()
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &session));
        if !current {
            return;
        }

        let local = session
            .local()
            .unwrap_or_else(|| self.placeholder_node(session.node_id()));
        let action = self.machine.lock().on_connection_lost(cause);

        match action {
            ReconnectAction::Segment => {
                self.stopped.store(true, Ordering::SeqCst);
                self.teardown(&session).await;
                self.state_tx.send_replace(ClientConnectionState::Segmented);
                self.emit_local(EventType::NodeSegmented, local);
            }
            ReconnectAction::Reconnect => {
                self.teardown(&session).await;
                self.state_tx.send_replace(ClientConnectionState::Disconnected);
                self.emit_local(EventType::ClientDisconnected, local.clone());
                self.reconnect(local).await;
            }
            ReconnectAction::AnnounceReconnected | ReconnectAction::Ignore => {}
        }
    }

    async fn teardown(&self, session: &Arc<Session>) {
        session.mark_leaving();
        self.release(session);
        self.transport.unbind(session.node_id()).await;
        session.shutdown().await;
    }

    /// Rejoins under fresh ids until accepted or the join timeout runs out.
    async fn reconnect(self: &Arc<Self>, previous: ClusterNode) {
        let _joining = self.joining.lock().await;
        let deadline = self
            .spec
            .config
            .join_deadline()
            .map(|timeout| Instant::now() + timeout);
        let last_version = self.topology.version();
        let mut delay_ms = RECONNECT_INITIAL_BACKOFF_MS;

        loop {
            if self.is_stopped() {
                return;
            }
            let node_id = NodeId::new();
            match self
                .join_as(node_id, Some((previous.id.clone(), last_version)), deadline)
                .await
            {
                Ok(node) => {
                    let action = self.machine.lock().on_rejoined();
                    if action == ReconnectAction::AnnounceReconnected {
                        tracing::info!(
                            "Client {} reconnected as {} with order {}",
                            previous.id,
                            node.id,
                            node.order
                        );
                        self.state_tx.send_replace(ClientConnectionState::Reconnected);
                        self.emit_local(EventType::ClientReconnected, node);
                    }
                    return;
                }
                Err(DiscoveryError::Stopped) => return,
                Err(e @ (DiscoveryError::JoinTimeout(_) | DiscoveryError::AuthenticationFailed(_))) => {
                    tracing::warn!("Client {} failed to reconnect: {}", previous.id, e);
                    break;
                }
                Err(e) => {
                    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                        tracing::warn!("Client {} failed to reconnect: {}", previous.id, e);
                        break;
                    }
                    tracing::debug!("Reconnect attempt of {} failed: {}, retrying", previous.id, e);
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(RECONNECT_MAX_BACKOFF_MS);
                }
            }
        }

        if self.machine.lock().on_reconnect_failed() == ReconnectAction::Segment {
            self.stopped.store(true, Ordering::SeqCst);
            self.state_tx.send_replace(ClientConnectionState::Segmented);
            self.emit_local(EventType::NodeSegmented, previous);
        }
    }

    fn emit_local(&self, event_type: EventType, node: ClusterNode) {
        let event = self.topology.local_event(event_type, node);
        self.listeners.notify(&event);
    }

    fn placeholder_node(&self, id: &NodeId) -> ClusterNode {
        ClusterNode {
            id: id.clone(),
            order: 0,
            internal_order: 0,
            consistent_id: self.consistent_id(),
            attributes: self.spec.attributes.clone(),
            client: self.spec.client,
        }
    }
}

impl std::fmt::Debug for DiscoveryNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryNode")
            .field("id", &self.id())
            .field("client", &self.spec.client)
            .field("state", &self.state())
            .field("version", &self.topology.version())
            .finish()
    }
}
