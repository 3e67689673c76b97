//! Node-to-Node Transport Module
//!
//! The discovery layer treats messaging as a capability: send to one node,
//! broadcast to a set of nodes, ping, and check connectivity to a set of nodes.
//!
//! ## Implementations
//! - **`local`**: In-process network shared by nodes of one process, with link
//!   failure injection for tests and the sandbox.
//! - **`http`**: Each bound node serves a small axum router; peers reach it with
//!   reqwest using the address published in the node's attributes.

pub mod handlers;
pub mod http;
pub mod local;
pub mod protocol;


pub use http::HttpTransport;
pub use local::{LocalNetwork, LocalTransport};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::membership::types::{ClusterNode, NodeId};

/// Type alias for an asynchronous inbound message handler: `(sender, payload)`.
pub type MessageHandlerFn =
    Arc<dyn Fn(NodeId, Vec<u8>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync>;

/// Wraps an async closure into a [`MessageHandlerFn`].
pub fn message_handler<F, Fut>(handler: F) -> MessageHandlerFn
where
    F: Fn(NodeId, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |from: NodeId, payload: Vec<u8>| {
        Box::pin(handler(from, payload)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
    })
}

/// Reachability of a list of nodes, one bit per node in list order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConnectivityBitmap {
    len: usize,
    words: Vec<u64>,
}

impl ConnectivityBitmap {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            words: vec![0; len.div_ceil(64)],
        }
    }

    pub fn from_bools(bits: &[bool]) -> Self {
        let mut bitmap = Self::new(bits.len());
        for (idx, bit) in bits.iter().enumerate() {
            bitmap.set(idx, *bit);
        }
        bitmap
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        if idx >= self.len {
            return;
        }
        let (word, bit) = (idx / 64, idx % 64);
        if value {
            self.words[word] |= 1 << bit;
        } else {
            self.words[word] &= !(1 << bit);
        }
    }

    pub fn get(&self, idx: usize) -> bool {
        idx < self.len && self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|idx| self.get(idx))
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts delivering messages addressed to `node_id` to `handler`.
    ///
    /// # Returns
    /// * Attributes peers need to reach the node; they are published in its topology entry.
    async fn bind(&self, node_id: &NodeId, handler: MessageHandlerFn)
    -> Result<BTreeMap<String, String>>;

    /// Stops delivering messages to `node_id`.
    async fn unbind(&self, node_id: &NodeId);

    async fn send(&self, from: &NodeId, to: &ClusterNode, payload: Vec<u8>) -> Result<()>;

    /// Sends to every node in `to`, reporting per-node results.
    async fn broadcast(
        &self,
        from: &NodeId,
        to: &[ClusterNode],
        payload: Vec<u8>,
    ) -> Vec<(NodeId, Result<()>)> {
        let sends = to.iter().map(|node| {
            let payload = payload.clone();
            async move { (node.id.clone(), self.send(from, node, payload).await) }
        });
        futures::future::join_all(sends).await
    }

    /// Whether `to` answers within `timeout`.
    async fn ping(&self, from: &NodeId, to: &ClusterNode, timeout: Duration) -> bool;

    /// Pings every node in `nodes` concurrently. `from` itself counts as reachable.
    async fn check_connection(
        &self,
        from: &NodeId,
        nodes: &[ClusterNode],
        timeout: Duration,
    ) -> ConnectivityBitmap {
        let pings = nodes.iter().map(|node| async move {
            if &node.id == from {
                true
            } else {
                self.ping(from, node, timeout).await
            }
        });
        let results = futures::future::join_all(pings).await;
        ConnectivityBitmap::from_bools(&results)
    }
}
