use std::time::Duration;
use thiserror::Error;

use crate::coordination::StoreError;
use crate::membership::types::NodeId;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors surfaced by the discovery layer.
///
/// Join errors are returned to the joining caller and never show up as events.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The coordinator's authenticator rejected this node.
    #[error("Authentication failed for local node: {0}")]
    AuthenticationFailed(String),
    /// Another alive (or recently departed) node already uses the requested id.
    #[error("Node with the same ID already exists: {0}")]
    DuplicateNodeId(NodeId),
    /// No coordinator answered the join request in time.
    #[error("Failed to connect to cluster within configured timeout ({0:?})")]
    JoinTimeout(Duration),
    /// The local node was cut off from the cluster and stopped.
    #[error("local node is segmented from the cluster")]
    Segmented,
    /// A communication problem resolution did not complete successfully.
    #[error("failed to resolve communication problem: {0}")]
    CommunicationResolution(#[source] Box<DiscoveryError>),
    /// The node an operation was aimed at left the topology.
    #[error("topology changed: {0}")]
    TopologyChanged(String),
    /// A resolver returned an error.
    #[error("resolver failed: {0}")]
    Resolver(String),
    #[error("node {0} is not part of the topology")]
    UnknownNode(NodeId),
    #[error("invalid node id: {0:?}")]
    InvalidNodeId(NodeId),
    #[error("local node has not joined the cluster")]
    NotJoined,
    #[error("local node is stopped")]
    Stopped,
    #[error("coordination error: {0}")]
    Coordination(#[from] StoreError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl DiscoveryError {
    /// Innermost cause of a resolution failure, or the error itself.
    pub fn root_cause(&self) -> &DiscoveryError {
        match self {
            DiscoveryError::CommunicationResolution(cause) => cause.root_cause(),
            other => other,
        }
    }

    pub fn is_topology_changed(&self) -> bool {
        matches!(self.root_cause(), DiscoveryError::TopologyChanged(_))
    }
}
