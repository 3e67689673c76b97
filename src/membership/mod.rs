//! Membership Registry Module
//!
//! Tracks which processes are alive. Each node holds exactly one ephemeral
//! alive marker, owned by its coordination session.
//!
//! ## Core Mechanisms
//! - **Alive markers**: `alive/<seq>-<nodeId>`, created when a node asks to join.
//!   The sequence is allocated by the coordination service and doubles as the
//!   node's internal order.
//! - **Failure detection**: a marker disappears when its session expires, when the
//!   node leaves, or when the coordinator forcibly evicts the node. Nothing else is
//!   treated as a failure signal.
//! - **Acknowledgments**: nodes publish their highest applied journal version in the
//!   marker payload so the coordinator can garbage collect the journal.

pub mod registry;
pub mod types;


pub use registry::MembershipRegistry;
pub use types::{AliveMarker, ClusterNode, MarkerData, NodeId};
