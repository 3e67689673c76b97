use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::MessageHandlerFn;
use super::protocol::{MessageRequest, MessageResponse, PingResponse};
use crate::membership::types::NodeId;

/// State of one bound node's HTTP endpoint.
pub struct Endpoint {
    pub node_id: NodeId,
    pub handler: MessageHandlerFn,
    /// Cleared on unbind; connections kept alive by peers must stop answering too.
    pub active: AtomicBool,
}

impl Endpoint {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

pub async fn handle_ping(
    Extension(endpoint): Extension<Arc<Endpoint>>,
    Path(node_id): Path<String>,
) -> (StatusCode, Json<PingResponse>) {
    let status = if !endpoint.is_active() {
        StatusCode::SERVICE_UNAVAILABLE
    } else if endpoint.node_id.as_str() == node_id {
        StatusCode::OK
    } else {
        // Stale address: another node now listens here
        StatusCode::NOT_FOUND
    };
    (
        status,
        Json(PingResponse {
            node_id: endpoint.node_id.clone(),
        }),
    )
}

pub async fn handle_message(
    Extension(endpoint): Extension<Arc<Endpoint>>,
    Json(req): Json<MessageRequest>,
) -> (StatusCode, Json<MessageResponse>) {
    if !endpoint.is_active() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(MessageResponse { delivered: false }),
        );
    }

    if req.to != endpoint.node_id {
        tracing::warn!(
            "Dropping message for {} delivered to {}",
            req.to,
            endpoint.node_id
        );
        return (
            StatusCode::NOT_FOUND,
            Json(MessageResponse { delivered: false }),
        );
    }

    match (endpoint.handler)(req.from.clone(), req.payload).await {
        Ok(()) => (StatusCode::OK, Json(MessageResponse { delivered: true })),
        Err(e) => {
            tracing::error!("Message handler failed for message from {}: {}", req.from, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(MessageResponse { delivered: false }),
            )
        }
    }
}
