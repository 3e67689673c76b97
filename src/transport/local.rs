use anyhow::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{ConnectivityBitmap, MessageHandlerFn, Transport};
use crate::membership::types::{ClusterNode, NodeId};

pub const LOCAL_ENDPOINT_ATTR: &str = "local.endpoint";

struct NetworkInner {
    endpoints: DashMap<NodeId, MessageHandlerFn>,
    /// Broken links, stored in both directions.
    broken: DashSet<(NodeId, NodeId)>,
    isolated: DashSet<NodeId>,
    paused_checks: watch::Sender<HashSet<NodeId>>,
}

/// In-process network hub shared by every node of one process.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        let (paused_checks, _) = watch::channel(HashSet::new());
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                broken: DashSet::new(),
                isolated: DashSet::new(),
                paused_checks,
            }),
        }
    }

    /// A transport handle on this network.
    pub fn transport(&self) -> Arc<LocalTransport> {
        Arc::new(LocalTransport {
            network: self.clone(),
        })
    }

    /// Makes `a` and `b` unreachable from each other.
    pub fn break_link(&self, a: &NodeId, b: &NodeId) {
        self.inner.broken.insert((a.clone(), b.clone()));
        self.inner.broken.insert((b.clone(), a.clone()));
    }

    pub fn heal_link(&self, a: &NodeId, b: &NodeId) {
        self.inner.broken.remove(&(a.clone(), b.clone()));
        self.inner.broken.remove(&(b.clone(), a.clone()));
    }

    /// Cuts `node` off from every other node.
    pub fn isolate(&self, node: &NodeId) {
        self.inner.isolated.insert(node.clone());
    }

    /// Holds connectivity checks started by `node` until [`Self::resume_checks`].
    pub fn pause_checks(&self, node: &NodeId) {
        self.inner.paused_checks.send_modify(|paused| {
            paused.insert(node.clone());
        });
    }

    pub fn resume_checks(&self, node: &NodeId) {
        self.inner.paused_checks.send_modify(|paused| {
            paused.remove(node);
        });
    }

    pub fn is_bound(&self, node: &NodeId) -> bool {
        self.inner.endpoints.contains_key(node)
    }

    pub fn can_reach(&self, from: &NodeId, to: &NodeId) -> bool {
        if from == to {
            return self.is_bound(to);
        }
        !self.inner.isolated.contains(from)
            && !self.inner.isolated.contains(to)
            && !self.inner.broken.contains(&(from.clone(), to.clone()))
            && self.is_bound(to)
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// [`Transport`] over a [`LocalNetwork`].
pub struct LocalTransport {
    network: LocalNetwork,
}

impl LocalTransport {
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn bind(
        &self,
        node_id: &NodeId,
        handler: MessageHandlerFn,
    ) -> Result<BTreeMap<String, String>> {
        match self.network.inner.endpoints.entry(node_id.clone()) {
            Entry::Occupied(_) => anyhow::bail!("node {} is already bound", node_id),
            Entry::Vacant(slot) => {
                slot.insert(handler);
            }
        }
        let mut attributes = BTreeMap::new();
        attributes.insert(LOCAL_ENDPOINT_ATTR.to_string(), node_id.to_string());
        Ok(attributes)
    }

    async fn unbind(&self, node_id: &NodeId) {
        self.network.inner.endpoints.remove(node_id);
    }

    async fn send(&self, from: &NodeId, to: &ClusterNode, payload: Vec<u8>) -> Result<()> {
        if !self.network.can_reach(from, &to.id) {
            return Err(anyhow::anyhow!("node {} is unreachable from {}", to.id, from));
        }
        let handler = self
            .network
            .inner
            .endpoints
            .get(&to.id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("node {} is not bound", to.id))?;

        handler(from.clone(), payload).await
    }

    async fn ping(&self, from: &NodeId, to: &ClusterNode, _timeout: Duration) -> bool {
        self.network.can_reach(from, &to.id)
    }

    async fn check_connection(
        &self,
        from: &NodeId,
        nodes: &[ClusterNode],
        _timeout: Duration,
    ) -> ConnectivityBitmap {
        let mut paused = self.network.inner.paused_checks.subscribe();
        if paused.borrow().contains(from) {
            tracing::debug!("Connectivity check of {} is on hold", from);
            let _ = paused.wait_for(|set| !set.contains(from)).await;
        }

        let bits: Vec<bool> = nodes
            .iter()
            .map(|node| self.network.can_reach(from, &node.id))
            .collect();
        ConnectivityBitmap::from_bools(&bits)
    }
}
