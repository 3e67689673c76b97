//! Discovery layout inside the coordination root.
//!
//! ```text
//! alive/<seq>-<nodeId>        ephemeral marker per node
//! joined/<seq>                join request, answered in place
//! events/<version>            event journal
//! custom/<seq>                queued custom messages
//! clients/<nodeId>            client records (last applied version)
//! requests/<seq>              leave / forced fail / resolution requests
//! resolve/<round>/<nodeId>    connectivity reports of a resolution round
//! ```

use crate::membership::types::NodeId;

pub const ALIVE: &str = "alive";
pub const JOINED: &str = "joined";
pub const EVENTS: &str = "events";
pub const CUSTOM: &str = "custom";
pub const CLIENTS: &str = "clients";
pub const REQUESTS: &str = "requests";
pub const RESOLVE: &str = "resolve";

pub const ALL_DIRS: [&str; 7] = [ALIVE, JOINED, EVENTS, CUSTOM, CLIENTS, REQUESTS, RESOLVE];

const SEQUENCE_WIDTH: usize = 10;

pub fn alive(name: &str) -> String {
    format!("{}/{}", ALIVE, name)
}

/// Marker name of a member, rebuilt from its `internal_order`.
pub fn alive_name(seq: u64, node_id: &NodeId) -> String {
    format!("{:0width$}-{}", seq, node_id, width = SEQUENCE_WIDTH)
}

pub fn joined(name: &str) -> String {
    format!("{}/{}", JOINED, name)
}

pub fn event(version: u64) -> String {
    format!("{}/{:020}", EVENTS, version)
}

pub fn custom(name: &str) -> String {
    format!("{}/{}", CUSTOM, name)
}

pub fn client(node_id: &NodeId) -> String {
    format!("{}/{}", CLIENTS, node_id)
}

pub fn request(name: &str) -> String {
    format!("{}/{}", REQUESTS, name)
}

pub fn resolve_round(round: u64) -> String {
    format!("{}/{:010}", RESOLVE, round)
}

pub fn resolve_report(round: u64, node_id: &NodeId) -> String {
    format!("{}/{:010}/{}", RESOLVE, round, node_id)
}

/// Sequence number embedded in a sequential node name (`0000000042` or `0000000042-x`).
pub fn parse_sequence(name: &str) -> Option<u64> {
    let digits = name.get(..SEQUENCE_WIDTH)?;
    match name.as_bytes().get(SEQUENCE_WIDTH) {
        None | Some(b'-') => digits.parse().ok(),
        Some(_) => None,
    }
}

/// Splits an alive marker name into its sequence and node id.
pub fn parse_alive(name: &str) -> Option<(u64, NodeId)> {
    let seq = parse_sequence(name)?;
    let id = name.get(SEQUENCE_WIDTH + 1..)?;
    if id.is_empty() {
        return None;
    }
    Some((seq, NodeId(id.to_string())))
}

pub fn parse_event(name: &str) -> Option<u64> {
    name.parse().ok()
}
