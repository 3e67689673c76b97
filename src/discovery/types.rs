use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::membership::types::{ClusterNode, NodeId};

/// Kind of a discovery event.
///
/// The first four are journaled and observed identically by every node. The last
/// three are local: they describe the local node's relationship to the cluster and
/// carry the version of the last applied journal entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    NodeJoined,
    NodeLeft,
    NodeFailed,
    Custom,
    NodeSegmented,
    ClientDisconnected,
    ClientReconnected,
}

impl EventType {
    fn bit(self) -> u32 {
        match self {
            EventType::NodeJoined => 1,
            EventType::NodeLeft => 1 << 1,
            EventType::NodeFailed => 1 << 2,
            EventType::Custom => 1 << 3,
            EventType::NodeSegmented => 1 << 4,
            EventType::ClientDisconnected => 1 << 5,
            EventType::ClientReconnected => 1 << 6,
        }
    }

    pub fn is_local(self) -> bool {
        matches!(
            self,
            EventType::NodeSegmented | EventType::ClientDisconnected | EventType::ClientReconnected
        )
    }

    /// Whether the event adds or removes a topology member.
    pub fn changes_topology(self) -> bool {
        matches!(
            self,
            EventType::NodeJoined | EventType::NodeLeft | EventType::NodeFailed
        )
    }
}

/// Set of event types a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const ALL: EventMask = EventMask(0x7f);

    pub fn of(types: &[EventType]) -> Self {
        types.iter().fold(Self::NONE, |mask, t| mask | *t)
    }

    pub fn contains(self, event_type: EventType) -> bool {
        self.0 & event_type.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<EventType> for EventMask {
    fn from(value: EventType) -> Self {
        EventMask(value.bit())
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOr<EventType> for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventType) -> EventMask {
        EventMask(self.0 | rhs.bit())
    }
}

impl BitOr for EventType {
    type Output = EventMask;

    fn bitor(self, rhs: EventType) -> EventMask {
        EventMask(self.bit() | rhs.bit())
    }
}

/// Immutable view of the topology at one version. Nodes are sorted by order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TopologySnapshot {
    pub version: u64,
    pub nodes: Vec<ClusterNode>,
}

impl TopologySnapshot {
    pub fn new(version: u64, mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by_key(|node| node.order);
        Self { version, nodes }
    }

    pub fn node(&self, id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|node| &node.id == id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.node(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn servers(&self) -> Vec<&ClusterNode> {
        self.nodes.iter().filter(|node| !node.client).collect()
    }

    pub fn clients(&self) -> Vec<&ClusterNode> {
        self.nodes.iter().filter(|node| node.client).collect()
    }

    /// The oldest server, which coordinates the cluster.
    pub fn coordinator(&self) -> Option<&ClusterNode> {
        self.nodes.iter().find(|node| !node.client)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id.clone()).collect()
    }

    pub fn max_order(&self) -> u64 {
        self.nodes.iter().map(|node| node.order).max().unwrap_or(0)
    }
}

/// A discovery event as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub event_type: EventType,
    pub version: u64,
    /// The node the event is about. For local events, the local node.
    pub node: ClusterNode,
    pub snapshot: Arc<TopologySnapshot>,
    /// Payload of `Custom` events.
    pub custom: Option<Vec<u8>>,
}

impl fmt::Display for DiscoveryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} v{} node={} order={} topology={}",
            self.event_type,
            self.version,
            self.node.id,
            self.node.order,
            self.snapshot.len()
        )
    }
}
