//! Cluster Discovery Library
//!
//! Cluster membership built on a hierarchical coordination service (ZooKeeper-like).
//! Every node agrees on the same ordered sequence of topology events; the binary
//! (`main.rs`) runs a sandbox cluster on top of it.
//!
//! ## Architecture Modules
//! - **`coordination`**: Sessions, ephemeral and sequential nodes, watches, and the
//!   in-memory ensemble used by tests and the sandbox.
//! - **`membership`**: Alive markers, election of the coordinator, acknowledgments.
//! - **`discovery`**: The node API, join handshake, coordinator loop and event journal.
//! - **`resolver`**: Communication problem resolvers deciding which nodes to kill.
//! - **`reconnect`**: The client connection state machine.
//! - **`transport`**: Node-to-node messaging, pings and connectivity checks.
//! - **`security`**: Join authentication.
//! - **`config`** / **`error`**: Operational parameters and the error type.

pub mod config;
pub mod coordination;
pub mod discovery;
pub mod error;
pub mod membership;
pub mod reconnect;
pub mod resolver;
pub mod security;
pub mod transport;
