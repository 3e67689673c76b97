//! Discovery Module
//!
//! Cluster membership on top of a coordination service. Nodes register
//! ephemeral alive markers; the alive server with the lowest order coordinates and
//! serializes every topology change into a versioned event journal that all
//! nodes apply in the same order.
//!
//! ## Components
//! - **`node`**: `DiscoveryNode`, the public API and the per-session watcher.
//! - **`join`**: Session lifecycle and the join handshake.
//! - **`coordinator`**: Election winner's reconcile loop (joins, failures,
//!   resolution rounds, custom events, journal GC).
//! - **`journal`**: The versioned event log.
//! - **`topology`**: Local, in-order application of journal entries.
//! - **`listeners`**: Event-mask keyed listener registry.
//! - **`protocol`**: Records exchanged through the coordination service.

pub mod coordinator;
pub mod join;
pub mod journal;
pub mod listeners;
pub mod node;
pub mod protocol;
pub mod topology;
pub mod types;

#[cfg(test)]
mod tests;

pub use journal::{EventJournal, JournalEntry};
pub use listeners::{ListenerRegistry, SubscriptionId};
pub use node::{DiscoveryNode, NodeSpec};
pub use topology::LocalTopology;
pub use types::{DiscoveryEvent, EventMask, EventType, TopologySnapshot};
