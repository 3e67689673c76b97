//! Network Protocol Definitions
//!
//! Data Transfer Objects used by the HTTP transport. Constants define the internal
//! endpoints each bound node serves.

use crate::membership::types::NodeId;
use serde::{Deserialize, Serialize};

pub const ENDPOINT_PING: &str = "/internal/ping";
pub const ENDPOINT_MESSAGE: &str = "/internal/message";

/// Attribute carrying the `host:port` a node's HTTP endpoint listens on.
pub const HTTP_ADDR_ATTR: &str = "http.addr";

#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub node_id: NodeId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageRequest {
    pub from: NodeId,
    pub to: NodeId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub delivered: bool,
}
