//! Coordinator
//!
//! The alive server with the lowest order runs one reconcile loop that turns
//! the coordination state into journal entries:
//!
//! 1. Requests (leave, forced fail, resolution) are consumed.
//! 2. Members whose marker disappeared are removed (`NodeLeft` / `NodeFailed`).
//! 3. An active resolution round is completed once every participant reported
//!    or the round timed out.
//! 4. Pending joins are answered, in request order, unless a round is active. A
//!    coordinator that is not a member yet admits itself first.
//! 5. Queued custom messages are turned into `Custom` events.
//! 6. Journal entries acknowledged by every member are collected.
//!
//! The loop is level triggered: it runs on every change of the coordination
//! tree and on a periodic tick, and always derives its work from what is stored.
//! A coordinator taking over rebuilds its state from the newest journal entry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::journal::{EventJournal, JournalEntry};
use super::protocol::{
    ClientRecord, ConnectivityReport, CoordinatorRequest, CustomMessage, JoinEntry, JoinRejection,
    JoinRequest, JoinResponse, ResolutionOutcome, ResolveRound,
};
use super::types::{EventType, TopologySnapshot};
use crate::config::DiscoveryConfig;
use crate::coordination::{self, CoordinationClient, CreateMode, StoreError, StoreResult, paths};
use crate::membership::registry::MembershipRegistry;
use crate::membership::types::{AliveMarker, ClusterNode, NodeId};
use crate::resolver::{CommunicationProblemContext, CommunicationProblemResolver, ConnectivityMatrix};
use crate::security::{AuthDecision, Authenticator, JoinCandidate};

/// Everything a coordinator needs from the node hosting it.
pub struct CoordinatorContext {
    pub client: Arc<CoordinationClient>,
    pub registry: Arc<MembershipRegistry>,
    pub journal: Arc<EventJournal>,
    pub local_id: NodeId,
    pub local_marker: String,
    pub authenticator: Arc<dyn Authenticator>,
    pub resolver: Arc<dyn CommunicationProblemResolver>,
    pub config: DiscoveryConfig,
}

/// Running coordinator loop. Dropping the handle does not stop it; call [`Self::stop`].
pub struct CoordinatorHandle {
    handle: JoinHandle<()>,
}

impl CoordinatorHandle {
    pub fn spawn(ctx: CoordinatorContext) -> Self {
        let coordinator = Coordinator { ctx };
        let handle = tokio::spawn(async move {
            coordinator.run().await;
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

struct ActiveRound {
    round: u64,
    request: String,
    initiator: NodeId,
    target: NodeId,
    participants: Vec<ClusterNode>,
    started: Instant,
}

/// In-memory state, rebuilt from the journal on takeover.
struct CoordinatorState {
    topology: TopologySnapshot,
    max_order: u64,
    /// Departed nodes with the version of their departure, while it is retained.
    departed: BTreeMap<NodeId, (ClusterNode, u64)>,
    leaving: HashSet<NodeId>,
    forced: HashMap<NodeId, String>,
    acks: HashMap<NodeId, u64>,
    round: Option<ActiveRound>,
    last_gc: Option<Instant>,
    resigned: bool,
}

impl CoordinatorState {
    fn apply(&mut self, entry: &JournalEntry) {
        self.topology = entry.snapshot();
        self.max_order = self.max_order.max(entry.max_order);
        if let Some(id) = entry.departed() {
            self.departed
                .insert(id.clone(), (entry.node.clone(), entry.version));
            self.leaving.remove(id);
            self.forced.remove(id);
            self.acks.remove(id);
        }
    }

    fn next_entry(
        &self,
        event_type: EventType,
        node: ClusterNode,
        nodes: Vec<ClusterNode>,
    ) -> JournalEntry {
        JournalEntry {
            version: self.topology.version + 1,
            event_type,
            node,
            nodes,
            max_order: self.max_order,
            custom: None,
            reason: None,
        }
    }
}

struct Coordinator {
    ctx: CoordinatorContext,
}

impl Coordinator {
    async fn run(self) {
        tracing::info!("Node {} is now the coordinator", self.ctx.local_id);

        let mut events = self.ctx.client.watch();
        let mut tick = tokio::time::interval(self.ctx.config.coordinator_tick);
        let mut state: Option<CoordinatorState> = None;

        loop {
            if state.is_none() {
                match self.load_state().await {
                    Ok(loaded) => state = Some(loaded),
                    Err(e) if e.is_session_loss() => break,
                    Err(e) => tracing::warn!("Coordinator failed to load state: {}", e),
                }
            }

            if let Some(current) = state.as_mut() {
                match self.reconcile(current).await {
                    Ok(()) if current.resigned => break,
                    Ok(()) => {}
                    Err(e) if e.is_session_loss() => break,
                    Err(StoreError::NodeExists(path)) => {
                        // Another coordinator appended first
                        tracing::warn!("Coordinator lost a write race on {}, reloading", path);
                        state = None;
                    }
                    Err(e) => {
                        tracing::warn!("Coordinator reconcile failed: {}", e);
                        state = None;
                    }
                }
            }

            tokio::select! {
                _ = tick.tick() => {}
                received = events.recv() => match received {
                    Ok(_) | Err(RecvError::Lagged(_)) => {
                        while events.try_recv().is_ok() {}
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        tracing::info!("Node {} stopped coordinating", self.ctx.local_id);
    }

    async fn load_state(&self) -> StoreResult<CoordinatorState> {
        let client = &self.ctx.client;
        let retained = self.ctx.journal.read_from(0).await?;

        let mut state = CoordinatorState {
            topology: TopologySnapshot::default(),
            max_order: 0,
            departed: BTreeMap::new(),
            leaving: HashSet::new(),
            forced: HashMap::new(),
            acks: HashMap::new(),
            round: None,
            last_gc: None,
            resigned: false,
        };
        for entry in &retained {
            state.apply(entry);
        }

        // Rounds of a previous coordinator restart from their request
        for name in client.children(paths::RESOLVE).await? {
            if let Some(round) = paths::parse_sequence(&name) {
                client.delete_recursive(&paths::resolve_round(round)).await?;
            }
        }

        tracing::info!(
            "Coordinator {} resumed at version {} with {} nodes",
            self.ctx.local_id,
            state.topology.version,
            state.topology.len()
        );
        Ok(state)
    }

    async fn reconcile(&self, state: &mut CoordinatorState) -> StoreResult<()> {
        let markers = self.ctx.registry.alive_markers().await?;
        let elected = MembershipRegistry::coordinator(&markers, &state.topology.nodes)
            .is_some_and(|m| m.name == self.ctx.local_marker);
        if !elected {
            tracing::info!("Node {} is no longer elected, resigning", self.ctx.local_id);
            state.resigned = true;
            return Ok(());
        }

        for marker in &markers {
            if let Some(node) = state.topology.node(&marker.node_id)
                && node.internal_order == marker.seq
            {
                state.acks.insert(marker.node_id.clone(), marker.data.acked_version);
            }
        }

        self.process_requests(state).await?;
        self.process_removals(state, &markers).await?;
        self.progress_round(state).await?;
        if state.resigned {
            return Ok(());
        }
        if state.round.is_none() {
            self.process_joins(state, &markers).await?;
        }
        self.process_custom(state).await?;
        self.collect_garbage(state, &markers).await?;
        Ok(())
    }

    // ============================================================
    // REQUESTS & REMOVALS
    // ============================================================

    async fn process_requests(&self, state: &mut CoordinatorState) -> StoreResult<()> {
        let client = &self.ctx.client;

        for name in client.children(paths::REQUESTS).await? {
            let path = paths::request(&name);
            let Some(stored) = client.get(&path).await? else {
                continue;
            };
            let request: CoordinatorRequest = coordination::decode(&stored.data)?;

            match request {
                // Kept until the removal is journaled so a reload still sees it
                CoordinatorRequest::Leave { node_id } => {
                    if state.topology.contains(&node_id) {
                        state.leaving.insert(node_id);
                    } else {
                        client.delete_if_exists(&path).await?;
                    }
                }
                CoordinatorRequest::ForceFail {
                    node_id,
                    requested_by,
                    reason,
                } => {
                    if let Some(node) = state.topology.node(&node_id).cloned() {
                        tracing::warn!("Node {} requested failure of {}: {}", requested_by, node_id, reason);
                        self.force_fail(state, node, reason).await?;
                    }
                    client.delete_if_exists(&path).await?;
                }
                CoordinatorRequest::Resolve {
                    initiator,
                    target,
                    outcome,
                } => {
                    if !state.topology.contains(&initiator) {
                        client.delete_if_exists(&path).await?;
                    } else if outcome.is_none() && state.round.is_none() {
                        self.start_round(state, name, initiator, target).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_removals(
        &self,
        state: &mut CoordinatorState,
        markers: &[AliveMarker],
    ) -> StoreResult<()> {
        let alive: HashSet<&str> = markers.iter().map(|m| m.name.as_str()).collect();
        let gone: Vec<ClusterNode> = state
            .topology
            .nodes
            .iter()
            .filter(|node| !alive.contains(paths::alive_name(node.internal_order, &node.id).as_str()))
            .cloned()
            .collect();

        for node in gone {
            let (event_type, reason) = if state.leaving.contains(&node.id) {
                (EventType::NodeLeft, None)
            } else {
                let reason = state
                    .forced
                    .get(&node.id)
                    .cloned()
                    .unwrap_or_else(|| "alive marker lost".to_string());
                (EventType::NodeFailed, Some(reason))
            };
            self.remove_member(state, node, event_type, reason).await?;
        }
        Ok(())
    }

    /// Deletes a member's marker and records its failure right away.
    async fn force_fail(
        &self,
        state: &mut CoordinatorState,
        node: ClusterNode,
        reason: String,
    ) -> StoreResult<()> {
        state.forced.insert(node.id.clone(), reason.clone());
        self.ctx
            .registry
            .force_remove(&paths::alive_name(node.internal_order, &node.id))
            .await?;
        self.remove_member(state, node, EventType::NodeFailed, Some(reason))
            .await
    }

    async fn remove_member(
        &self,
        state: &mut CoordinatorState,
        node: ClusterNode,
        event_type: EventType,
        reason: Option<String>,
    ) -> StoreResult<()> {
        let nodes = state
            .topology
            .nodes
            .iter()
            .filter(|member| member.id != node.id)
            .cloned()
            .collect();
        let mut entry = state.next_entry(event_type, node.clone(), nodes);
        entry.reason = reason;

        let acked = state.acks.get(&node.id).copied();
        self.ctx.journal.append(&entry).await?;
        state.apply(&entry);

        if node.client
            && let Some(last_version) = acked
        {
            let record = ClientRecord {
                consistent_id: node.consistent_id.clone(),
                last_version,
            };
            match self
                .ctx
                .client
                .create(&paths::client(&node.id), coordination::encode(&record)?, CreateMode::Persistent)
                .await
            {
                Ok(()) | Err(StoreError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        match event_type {
            EventType::NodeLeft => {
                tracing::info!("Node {} left at version {}", node.id, entry.version)
            }
            _ => tracing::warn!(
                "Node {} failed at version {} ({})",
                node.id,
                entry.version,
                entry.reason.as_deref().unwrap_or("unknown")
            ),
        }
        Ok(())
    }

    // ============================================================
    // COMMUNICATION PROBLEM RESOLUTION
    // ============================================================

    async fn start_round(
        &self,
        state: &mut CoordinatorState,
        request: String,
        initiator: NodeId,
        target: NodeId,
    ) -> StoreResult<()> {
        let participants = state.topology.nodes.clone();
        let round = ResolveRound {
            request: request.clone(),
            topology_version: state.topology.version,
            participants: participants.clone(),
        };
        let name = self
            .ctx
            .client
            .create_sequential(paths::RESOLVE, "", coordination::encode(&round)?, CreateMode::Persistent)
            .await?;
        let number = paths::parse_sequence(&name).ok_or_else(|| StoreError::NoNode(name.clone()))?;

        tracing::info!(
            "Started resolution round {} ({} -> {}, {} participants)",
            number,
            initiator,
            target,
            participants.len()
        );
        state.round = Some(ActiveRound {
            round: number,
            request,
            initiator,
            target,
            participants,
            started: Instant::now(),
        });
        Ok(())
    }

    async fn progress_round(&self, state: &mut CoordinatorState) -> StoreResult<()> {
        let client = &self.ctx.client;
        let Some(active) = state.round.as_ref() else {
            return Ok(());
        };

        let round_path = paths::resolve_round(active.round);
        let mut reports = Vec::new();
        for name in client.children(&round_path).await? {
            if let Some(stored) = client.get(&format!("{}/{}", round_path, name)).await? {
                reports.push(coordination::decode::<ConnectivityReport>(&stored.data)?);
            }
        }

        let alive: Vec<ClusterNode> = active
            .participants
            .iter()
            .filter(|p| state.topology.contains(&p.id))
            .cloned()
            .collect();
        let all_reported = alive
            .iter()
            .all(|p| reports.iter().any(|r| r.reporter == p.id));
        if !all_reported && active.started.elapsed() < self.ctx.config.resolution_timeout {
            return Ok(());
        }

        let Some(active) = state.round.take() else {
            return Ok(());
        };
        if !all_reported {
            tracing::warn!(
                "Resolution round {} timed out with {}/{} reports",
                active.round,
                reports.len(),
                alive.len()
            );
        }

        let mut matrix =
            ConnectivityMatrix::new(active.participants.iter().map(|p| p.id.clone()).collect());
        for report in reports {
            matrix.set_report(report.reporter, report.reachable);
        }
        let topology = Arc::new(TopologySnapshot::new(state.topology.version, alive));
        let mut problem = CommunicationProblemContext::new(
            topology,
            matrix,
            active.initiator.clone(),
            active.target.clone(),
        );

        let outcome = match self.ctx.resolver.resolve(&mut problem) {
            Ok(()) => ResolutionOutcome::Completed {
                killed: problem.killed_nodes().into_iter().map(|n| n.id).collect(),
            },
            Err(e) => {
                tracing::warn!("Resolver {} failed: {:#}", self.ctx.resolver.name(), e);
                ResolutionOutcome::Failed(e.to_string())
            }
        };

        let mut kill_self = None;
        if let ResolutionOutcome::Completed { killed } = &outcome {
            tracing::info!(
                "Resolution round {} completed, killing {:?}",
                active.round,
                killed
            );
            for node in problem.killed_nodes() {
                if node.id == self.ctx.local_id {
                    kill_self = Some(node);
                } else if state.topology.contains(&node.id) {
                    self.force_fail(state, node, "communication problem resolution".to_string())
                        .await?;
                }
            }
        }

        self.answer_request(&active, outcome).await?;
        client.delete_recursive(&round_path).await?;

        if let Some(node) = kill_self {
            self.force_fail(state, node, "communication problem resolution".to_string())
                .await?;
            state.resigned = true;
        }
        Ok(())
    }

    async fn answer_request(&self, round: &ActiveRound, outcome: ResolutionOutcome) -> StoreResult<()> {
        let path = paths::request(&round.request);
        let Some(stored) = self.ctx.client.get(&path).await? else {
            return Ok(());
        };
        let answered = CoordinatorRequest::Resolve {
            initiator: round.initiator.clone(),
            target: round.target.clone(),
            outcome: Some(outcome),
        };
        match self
            .ctx
            .client
            .set(&path, coordination::encode(&answered)?, Some(stored.version))
            .await
        {
            Ok(_) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ============================================================
    // JOINS
    // ============================================================

    async fn process_joins(
        &self,
        state: &mut CoordinatorState,
        markers: &[AliveMarker],
    ) -> StoreResult<()> {
        let client = &self.ctx.client;
        let member = state.topology.nodes.iter().any(|node| {
            node.id == self.ctx.local_id
                && paths::alive_name(node.internal_order, &node.id) == self.ctx.local_marker
        });

        for name in client.children(paths::JOINED).await? {
            let path = paths::joined(&name);
            let Some(stored) = client.get(&path).await? else {
                continue;
            };
            let mut entry: JoinEntry = coordination::decode(&stored.data)?;
            if entry.response.is_some() {
                continue;
            }
            // Keeps the coordinator the member with the lowest order
            if !member && entry.request.marker_name != self.ctx.local_marker {
                continue;
            }

            let request = &entry.request;
            // The marker may have been created after `markers` was read
            if !markers.iter().any(|m| m.name == request.marker_name)
                && !self.ctx.registry.marker_exists(&request.marker_name).await?
            {
                tracing::info!("Dropping join request of {}, candidate is gone", request.node_id);
                client.delete_if_exists(&path).await?;
                continue;
            }

            let response = match state.topology.node(&request.node_id) {
                // Accepted by a previous coordinator that did not answer
                Some(existing) if existing.internal_order == request.marker_seq => {
                    JoinResponse::Accepted {
                        node: existing.clone(),
                        snapshot: state.topology.clone(),
                        missed: None,
                    }
                }
                _ => self.admit(state, request).await?,
            };

            entry.response = Some(response);
            match client
                .set(&path, coordination::encode(&entry)?, Some(stored.version))
                .await
            {
                Ok(_) | Err(StoreError::NoNode(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn admit(&self, state: &mut CoordinatorState, request: &JoinRequest) -> StoreResult<JoinResponse> {
        let candidate = JoinCandidate {
            node_id: &request.node_id,
            consistent_id: &request.consistent_id,
            attributes: &request.attributes,
            client: request.client,
        };
        if let AuthDecision::Reject(reason) =
            self.ctx.authenticator.authenticate(&candidate, &request.credentials)
        {
            tracing::warn!("Rejected join of {}: authentication failed ({})", request.node_id, reason);
            return Ok(JoinResponse::Rejected(JoinRejection::Authentication(reason)));
        }

        if state.topology.contains(&request.node_id) || state.departed.contains_key(&request.node_id) {
            tracing::warn!("Rejected join of {}: duplicate node id", request.node_id);
            return Ok(JoinResponse::Rejected(JoinRejection::DuplicateId));
        }

        let node = ClusterNode {
            id: request.node_id.clone(),
            order: state.max_order + 1,
            internal_order: request.marker_seq,
            consistent_id: request.consistent_id.clone(),
            attributes: request.attributes.clone(),
            client: request.client,
        };
        let mut nodes = state.topology.nodes.clone();
        nodes.push(node.clone());
        let mut entry = state.next_entry(EventType::NodeJoined, node.clone(), nodes);
        entry.max_order = node.order;

        self.ctx.journal.append(&entry).await?;
        state.apply(&entry);

        let missed = match &request.previous_id {
            Some(previous) => self.reconnect_delta(state, previous, request.last_version).await?,
            None => None,
        };

        tracing::info!(
            "Node {} joined as {} with order {} at version {}",
            node.id,
            if node.client { "client" } else { "server" },
            node.order,
            entry.version
        );
        Ok(JoinResponse::Accepted {
            node,
            snapshot: state.topology.clone(),
            missed,
        })
    }

    /// Entries a reconnecting client missed, if all of them are still retained.
    async fn reconnect_delta(
        &self,
        state: &CoordinatorState,
        previous: &NodeId,
        last_version: Option<u64>,
    ) -> StoreResult<Option<Vec<JournalEntry>>> {
        let record_path = paths::client(previous);
        let record = match self.ctx.client.get(&record_path).await? {
            Some(stored) => Some(coordination::decode::<ClientRecord>(&stored.data)?),
            None => None,
        };
        self.ctx.client.delete_if_exists(&record_path).await?;

        let Some(from) = last_version.or(record.map(|r| r.last_version)) else {
            return Ok(None);
        };
        let entries = self.ctx.journal.read_from(from).await?;
        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(idx, entry)| entry.version == from + 1 + idx as u64);
        let complete = entries.last().map(|e| e.version) == Some(state.topology.version);

        if contiguous && complete {
            Ok(Some(entries))
        } else {
            tracing::debug!("No delta for {} from version {}", previous, from);
            Ok(None)
        }
    }

    // ============================================================
    // CUSTOM EVENTS & GARBAGE COLLECTION
    // ============================================================

    async fn process_custom(&self, state: &mut CoordinatorState) -> StoreResult<()> {
        let client = &self.ctx.client;

        for name in client.children(paths::CUSTOM).await? {
            let path = paths::custom(&name);
            let Some(stored) = client.get(&path).await? else {
                continue;
            };
            let message: CustomMessage = coordination::decode(&stored.data)?;
            let known = state
                .topology
                .node(&message.sender)
                .or_else(|| state.departed.get(&message.sender).map(|(node, _)| node));
            let Some(sender) = known.cloned() else {
                tracing::warn!("Dropping custom message {} from unknown node {}", name, message.sender);
                client.delete_if_exists(&path).await?;
                continue;
            };

            let mut entry = state.next_entry(EventType::Custom, sender, state.topology.nodes.clone());
            entry.custom = Some(message.payload);
            self.ctx.journal.append(&entry).await?;
            state.apply(&entry);
            client.delete_if_exists(&path).await?;
        }
        Ok(())
    }

    async fn collect_garbage(
        &self,
        state: &mut CoordinatorState,
        markers: &[AliveMarker],
    ) -> StoreResult<()> {
        if let Some(last) = state.last_gc
            && last.elapsed() < self.ctx.config.coordinator_tick
        {
            return Ok(());
        }
        state.last_gc = Some(Instant::now());

        let client = &self.ctx.client;
        let floor = state
            .topology
            .nodes
            .iter()
            .map(|node| state.acks.get(&node.id).copied().unwrap_or(0))
            .min()
            .unwrap_or(state.topology.version);
        self.ctx.journal.collect_garbage(floor).await?;

        let oldest = self.ctx.journal.oldest_version().await?.unwrap_or(0);
        state.departed.retain(|_, (_, version)| *version >= oldest);

        for name in client.children(paths::JOINED).await? {
            let path = paths::joined(&name);
            let Some(stored) = client.get(&path).await? else {
                continue;
            };
            let entry: JoinEntry = coordination::decode(&stored.data)?;
            if entry.response.is_some() && !markers.iter().any(|m| m.name == entry.request.marker_name) {
                client.delete_if_exists(&path).await?;
            }
        }

        for name in client.children(paths::CLIENTS).await? {
            let path = format!("{}/{}", paths::CLIENTS, name);
            let Some(stored) = client.get(&path).await? else {
                continue;
            };
            let record: ClientRecord = coordination::decode(&stored.data)?;
            if record.last_version + 1 < oldest {
                client.delete_if_exists(&path).await?;
            }
        }
        Ok(())
    }
}
