//! Coordination Payload Definitions
//!
//! Records exchanged through the coordination service between joining nodes,
//! members and the coordinator. All of them are `bincode` encoded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::journal::JournalEntry;
use super::types::TopologySnapshot;
use crate::membership::types::{ClusterNode, NodeId};
use crate::security::Credentials;
use crate::transport::ConnectivityBitmap;

/// Request written by a candidate under `joined/<seq>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub consistent_id: String,
    pub attributes: BTreeMap<String, String>,
    pub client: bool,
    pub credentials: Credentials,
    /// Name of the candidate's alive marker.
    pub marker_name: String,
    pub marker_seq: u64,
    /// Id the node had before a client reconnect.
    pub previous_id: Option<NodeId>,
    /// Last journal version the node applied before reconnecting.
    pub last_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JoinRejection {
    Authentication(String),
    DuplicateId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum JoinResponse {
    Accepted {
        node: ClusterNode,
        /// Topology right after the join event.
        snapshot: TopologySnapshot,
        /// Journal entries after `last_version` up to and including the join, when
        /// all of them were still retained.
        missed: Option<Vec<JournalEntry>>,
    },
    Rejected(JoinRejection),
}

/// Content of `joined/<seq>`. The coordinator answers in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinEntry {
    pub request: JoinRequest,
    pub response: Option<JoinResponse>,
}

/// Content of `requests/<seq>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CoordinatorRequest {
    /// Written before a node deletes its marker, so its removal is a `Left`.
    Leave { node_id: NodeId },
    /// Evict a member.
    ForceFail {
        node_id: NodeId,
        requested_by: NodeId,
        reason: String,
    },
    /// Run a communication problem resolution round.
    Resolve {
        initiator: NodeId,
        target: NodeId,
        outcome: Option<ResolutionOutcome>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Completed { killed: Vec<NodeId> },
    Failed(String),
}

/// Content of `resolve/<round>`. The round number is the node's sequence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolveRound {
    /// Request that started the round.
    pub request: String,
    pub topology_version: u64,
    pub participants: Vec<ClusterNode>,
}

/// Content of `resolve/<round>/<nodeId>`: what the reporter could reach, indexed like
/// the round's participant list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectivityReport {
    pub reporter: NodeId,
    pub reachable: ConnectivityBitmap,
}

/// Content of `clients/<nodeId>`, kept for a failed client so it can reconnect with a delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRecord {
    pub consistent_id: String,
    pub last_version: u64,
}

/// Content of `custom/<seq>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomMessage {
    pub sender: NodeId,
    pub payload: Vec<u8>,
}
