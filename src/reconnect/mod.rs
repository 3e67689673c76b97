//! Client Reconnect State Machine
//!
//! Tracks how the local node relates to the cluster and decides what to do when
//! the connection is lost. The machine is pure; the node runtime feeds it
//! observations and carries out the returned actions.
//!
//! ```text
//! Connected ──lost──> Disconnected ──rejoined──> Reconnected
//!     │                    │                          │
//!     │                    └──gave up──> Segmented <──┘ (lost, reconnect disabled)
//!     └──lost (server or reconnect disabled)──> Segmented
//! ```
//!
//! `Segmented` is terminal. A reconnected client behaves like a connected one and
//! may disconnect again.


use serde::{Deserialize, Serialize};

use crate::discovery::types::EventType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientConnectionState {
    Connected,
    Disconnected,
    Reconnected,
    Segmented,
}

impl ClientConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ClientConnectionState::Connected | ClientConnectionState::Reconnected
        )
    }
}

/// Why the local node lost its place in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectCause {
    /// The coordination session expired or the coordination service stayed
    /// unreachable for longer than the session timeout.
    SessionExpired,
    /// No server is left in the cluster.
    ServersLeft,
    /// The node was evicted (forcible fail or resolver decision).
    ForcedFail,
    /// Reconnect requested locally.
    Forced,
}

/// What the runtime must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Emit `ClientDisconnected`, drop the session and start rejoining.
    Reconnect,
    /// Emit `NodeSegmented` and stop the node.
    Segment,
    /// Emit `ClientReconnected`.
    AnnounceReconnected,
    /// Nothing to do; the observation was stale.
    Ignore,
}

impl ReconnectAction {
    /// Local event to deliver for this action.
    pub fn event_type(self) -> Option<EventType> {
        match self {
            ReconnectAction::Reconnect => Some(EventType::ClientDisconnected),
            ReconnectAction::Segment => Some(EventType::NodeSegmented),
            ReconnectAction::AnnounceReconnected => Some(EventType::ClientReconnected),
            ReconnectAction::Ignore => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconnectStateMachine {
    state: ClientConnectionState,
    client: bool,
    reconnect_disabled: bool,
    disconnects: u64,
    reconnects: u64,
}

impl ReconnectStateMachine {
    /// Machine for a freshly joined node.
    pub fn new(client: bool, reconnect_disabled: bool) -> Self {
        Self {
            state: ClientConnectionState::Connected,
            client,
            reconnect_disabled,
            disconnects: 0,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ClientConnectionState {
        self.state
    }

    pub fn disconnects(&self) -> u64 {
        self.disconnects
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    /// The node lost its session or its place in the topology.
    pub fn on_connection_lost(&mut self, cause: DisconnectCause) -> ReconnectAction {
        if !self.state.is_connected() {
            return ReconnectAction::Ignore;
        }

        let can_reconnect = self.client && !self.reconnect_disabled;
        if can_reconnect {
            tracing::info!("Client lost cluster connection ({:?}), reconnecting", cause);
            self.state = ClientConnectionState::Disconnected;
            self.disconnects += 1;
            ReconnectAction::Reconnect
        } else {
            tracing::warn!("Local node segmented ({:?})", cause);
            self.state = ClientConnectionState::Segmented;
            ReconnectAction::Segment
        }
    }

    /// A reconnect attempt was accepted by the cluster.
    pub fn on_rejoined(&mut self) -> ReconnectAction {
        if self.state != ClientConnectionState::Disconnected {
            return ReconnectAction::Ignore;
        }
        self.state = ClientConnectionState::Reconnected;
        self.reconnects += 1;
        ReconnectAction::AnnounceReconnected
    }

    /// Rejoining failed for good (no server within the join timeout, or rejected).
    pub fn on_reconnect_failed(&mut self) -> ReconnectAction {
        if self.state != ClientConnectionState::Disconnected {
            return ReconnectAction::Ignore;
        }
        self.state = ClientConnectionState::Segmented;
        ReconnectAction::Segment
    }
}
