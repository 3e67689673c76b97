//! Communication Problem Resolver Module
//!
//! When a node reports it cannot talk to another member, the coordinator runs a
//! resolution round: every participant checks its connectivity to all others, and
//! the configured resolver decides from the resulting matrix which nodes to kill.
//!
//! ## Resolvers
//! - **NoOp**: kills nothing.
//! - **KillCoordinator**: kills the current coordinator.
//! - **KillRandom**: kills a random set of fewer than half of the nodes.
//! - **Default**: keeps the largest group of mutually connected servers (see `default`).
//! - **Custom**: any [`CommunicationProblemResolver`].
//!
//! A resolver only records decisions on the context. Kills of nodes that are not in
//! the context's topology are ignored.

pub mod default;


pub use default::DefaultResolver;

use anyhow::Result;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::config::ResolverConfig;
use crate::discovery::types::TopologySnapshot;
use crate::membership::types::{ClusterNode, NodeId};
use crate::transport::ConnectivityBitmap;

/// Who can reach whom, as reported by the participants of one round.
///
/// Rows are indexed like `nodes`. A participant that did not report has no row and
/// is treated as reaching nobody.
#[derive(Debug, Clone, Default)]
pub struct ConnectivityMatrix {
    nodes: Vec<NodeId>,
    index: HashMap<NodeId, usize>,
    rows: HashMap<NodeId, ConnectivityBitmap>,
}

impl ConnectivityMatrix {
    pub fn new(nodes: Vec<NodeId>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(idx, id)| (id.clone(), idx))
            .collect();
        Self {
            nodes,
            index,
            rows: HashMap::new(),
        }
    }

    /// Matrix in which every node reaches every other node.
    pub fn fully_connected(nodes: Vec<NodeId>) -> Self {
        let mut matrix = Self::new(nodes);
        let all = ConnectivityBitmap::from_bools(&vec![true; matrix.nodes.len()]);
        for id in matrix.nodes.clone() {
            matrix.rows.insert(id, all.clone());
        }
        matrix
    }

    pub fn set_report(&mut self, reporter: NodeId, reachable: ConnectivityBitmap) {
        if self.index.contains_key(&reporter) {
            self.rows.insert(reporter, reachable);
        }
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn has_report(&self, node: &NodeId) -> bool {
        self.rows.contains_key(node)
    }

    /// Whether `from` reported `to` as reachable.
    pub fn connected(&self, from: &NodeId, to: &NodeId) -> bool {
        if from == to {
            return self.index.contains_key(from);
        }
        match (self.rows.get(from), self.index.get(to)) {
            (Some(row), Some(&idx)) => row.get(idx),
            _ => false,
        }
    }

    pub fn mutually_connected(&self, a: &NodeId, b: &NodeId) -> bool {
        self.connected(a, b) && self.connected(b, a)
    }
}

/// Input of one resolution, and the kill decisions made on it.
pub struct CommunicationProblemContext {
    topology: Arc<TopologySnapshot>,
    connectivity: ConnectivityMatrix,
    initiator: NodeId,
    target: NodeId,
    killed: BTreeSet<NodeId>,
}

impl CommunicationProblemContext {
    pub fn new(
        topology: Arc<TopologySnapshot>,
        connectivity: ConnectivityMatrix,
        initiator: NodeId,
        target: NodeId,
    ) -> Self {
        Self {
            topology,
            connectivity,
            initiator,
            target,
            killed: BTreeSet::new(),
        }
    }

    pub fn topology(&self) -> &TopologySnapshot {
        &self.topology
    }

    pub fn connectivity(&self) -> &ConnectivityMatrix {
        &self.connectivity
    }

    /// Node that reported the problem.
    pub fn initiator(&self) -> &NodeId {
        &self.initiator
    }

    /// Node the initiator could not communicate with.
    pub fn target(&self) -> &NodeId {
        &self.target
    }

    /// Marks `id` for eviction. Unknown nodes are ignored.
    pub fn kill_node(&mut self, id: &NodeId) {
        if self.topology.contains(id) {
            self.killed.insert(id.clone());
        } else {
            tracing::debug!("Resolver asked to kill {} which is not in the topology", id);
        }
    }

    pub fn is_killed(&self, id: &NodeId) -> bool {
        self.killed.contains(id)
    }

    /// Killed nodes in topology order.
    pub fn killed_nodes(&self) -> Vec<ClusterNode> {
        self.topology
            .nodes
            .iter()
            .filter(|node| self.killed.contains(&node.id))
            .cloned()
            .collect()
    }
}

pub trait CommunicationProblemResolver: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn resolve(&self, ctx: &mut CommunicationProblemContext) -> Result<()>;
}

pub struct NoOpResolver;

impl CommunicationProblemResolver for NoOpResolver {
    fn name(&self) -> &str {
        "noop"
    }

    fn resolve(&self, _ctx: &mut CommunicationProblemContext) -> Result<()> {
        Ok(())
    }
}

pub struct KillCoordinatorResolver;

impl CommunicationProblemResolver for KillCoordinatorResolver {
    fn name(&self) -> &str {
        "kill_coordinator"
    }

    fn resolve(&self, ctx: &mut CommunicationProblemContext) -> Result<()> {
        let coordinator = ctx
            .topology()
            .coordinator()
            .map(|node| node.id.clone())
            .ok_or_else(|| anyhow::anyhow!("topology has no coordinator"))?;
        ctx.kill_node(&coordinator);
        Ok(())
    }
}

pub struct KillRandomResolver;

impl CommunicationProblemResolver for KillRandomResolver {
    fn name(&self) -> &str {
        "kill_random"
    }

    fn resolve(&self, ctx: &mut CommunicationProblemContext) -> Result<()> {
        let ids = ctx.topology().ids();
        if ids.len() < 2 {
            return Ok(());
        }

        use rand::Rng;
        let mut rng = rand::thread_rng();
        let count = rng.gen_range(0..ids.len() / 2);
        let victims: Vec<NodeId> = ids.choose_multiple(&mut rng, count).cloned().collect();
        for id in &victims {
            ctx.kill_node(id);
        }
        Ok(())
    }
}

/// Resolver selection for a node.
#[derive(Clone)]
pub enum ResolverKind {
    NoOp,
    KillCoordinator,
    KillRandom,
    Default,
    Custom(Arc<dyn CommunicationProblemResolver>),
}

impl ResolverKind {
    pub fn resolver(&self) -> Arc<dyn CommunicationProblemResolver> {
        match self {
            ResolverKind::NoOp => Arc::new(NoOpResolver),
            ResolverKind::KillCoordinator => Arc::new(KillCoordinatorResolver),
            ResolverKind::KillRandom => Arc::new(KillRandomResolver),
            ResolverKind::Default => Arc::new(DefaultResolver),
            ResolverKind::Custom(resolver) => resolver.clone(),
        }
    }
}

impl From<&ResolverConfig> for ResolverKind {
    fn from(config: &ResolverConfig) -> Self {
        match config {
            ResolverConfig::NoOp => ResolverKind::NoOp,
            ResolverConfig::KillCoordinator => ResolverKind::KillCoordinator,
            ResolverConfig::KillRandom => ResolverKind::KillRandom,
            ResolverConfig::Default => ResolverKind::Default,
        }
    }
}

impl fmt::Debug for ResolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverKind::Custom(resolver) => write!(f, "Custom({})", resolver.name()),
            other => f.write_str(other.resolver().name()),
        }
    }
}
