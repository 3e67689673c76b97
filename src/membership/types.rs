use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ids end up inside coordination paths, so they must be single path segments.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.contains('/')
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A member of the topology.
///
/// Created by the coordinator when it accepts a join and immutable afterwards.
/// `order` is assigned in join order and never reused; `internal_order` is the
/// sequence of the node's alive marker and ties this entry to exactly one marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: NodeId,
    pub order: u64,
    pub internal_order: u64,
    pub consistent_id: String,
    pub attributes: BTreeMap<String, String>,
    pub client: bool,
}

impl ClusterNode {
    pub fn is_server(&self) -> bool {
        !self.client
    }
}

/// Payload of an alive marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MarkerData {
    pub client: bool,
    /// Highest journal version the node has applied and acknowledged.
    pub acked_version: u64,
}

/// Ephemeral registration of a node, owned by the node's coordination session.
///
/// Its disappearance is the only failure signal the coordinator acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveMarker {
    pub seq: u64,
    pub node_id: NodeId,
    /// Child name under `alive/`.
    pub name: String,
    pub data: MarkerData,
}

impl AliveMarker {
    pub fn is_client(&self) -> bool {
        self.data.client
    }
}
