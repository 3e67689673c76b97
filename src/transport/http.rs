use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Extension, Router,
    routing::{get, post},
};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::handlers::{Endpoint, handle_message, handle_ping};
use super::protocol::{ENDPOINT_MESSAGE, ENDPOINT_PING, HTTP_ADDR_ATTR, MessageRequest};
use super::{MessageHandlerFn, Transport};
use crate::membership::types::{ClusterNode, NodeId};

const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const SEND_ATTEMPTS: usize = 3;

struct Binding {
    addr: SocketAddr,
    endpoint: Arc<Endpoint>,
    server: JoinHandle<()>,
}

impl Binding {
    fn shutdown(&self) {
        self.endpoint.active.store(false, Ordering::SeqCst);
        self.server.abort();
    }
}

/// HTTP transport. Every bound node gets its own listener on `host` with an
/// OS-assigned port.
pub struct HttpTransport {
    host: IpAddr,
    http_client: reqwest::Client,
    bindings: DashMap<NodeId, Binding>,
}

impl HttpTransport {
    pub fn new(host: IpAddr) -> Arc<Self> {
        Arc::new(Self {
            host,
            http_client: reqwest::Client::new(),
            bindings: DashMap::new(),
        })
    }

    pub fn local_addr(&self, node_id: &NodeId) -> Option<SocketAddr> {
        self.bindings.get(node_id).map(|binding| binding.addr)
    }

    fn address_of(node: &ClusterNode) -> Result<&str> {
        node.attributes
            .get(HTTP_ADDR_ATTR)
            .map(|addr| addr.as_str())
            .ok_or_else(|| anyhow::anyhow!("node {} publishes no HTTP address", node.id))
    }

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn bind(
        &self,
        node_id: &NodeId,
        handler: MessageHandlerFn,
    ) -> Result<BTreeMap<String, String>> {
        if self.bindings.contains_key(node_id) {
            anyhow::bail!("node {} is already bound", node_id);
        }
        let endpoint = Arc::new(Endpoint {
            node_id: node_id.clone(),
            handler,
            active: AtomicBool::new(true),
        });

        let app = Router::new()
            .route(&format!("{}/:id", ENDPOINT_PING), get(handle_ping))
            .route(ENDPOINT_MESSAGE, post(handle_message))
            .layer(Extension(endpoint.clone()));

        let listener = tokio::net::TcpListener::bind(SocketAddr::new(self.host, 0)).await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("HTTP transport server on {} stopped: {}", addr, e);
            }
        });

        if let Some(previous) = self.bindings.insert(
            node_id.clone(),
            Binding {
                addr,
                endpoint,
                server,
            },
        ) {
            previous.shutdown();
        }
        tracing::info!("Node {} listening for peers on http://{}", node_id, addr);

        let mut attributes = BTreeMap::new();
        attributes.insert(HTTP_ADDR_ATTR.to_string(), addr.to_string());
        Ok(attributes)
    }

    async fn unbind(&self, node_id: &NodeId) {
        if let Some((_, binding)) = self.bindings.remove(node_id) {
            binding.shutdown();
            tracing::info!("Node {} stopped listening on {}", node_id, binding.addr);
        }
    }

    async fn send(&self, from: &NodeId, to: &ClusterNode, payload: Vec<u8>) -> Result<()> {
        let url = format!("http://{}{}", Self::address_of(to)?, ENDPOINT_MESSAGE);
        let request = MessageRequest {
            from: from.clone(),
            to: to.id.clone(),
            payload,
        };

        let response = self
            .post_with_retry(url, &request, SEND_TIMEOUT, SEND_ATTEMPTS)
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "node {} rejected message: HTTP {}",
                to.id,
                response.status()
            ));
        }
        Ok(())
    }

    async fn ping(&self, _from: &NodeId, to: &ClusterNode, timeout: Duration) -> bool {
        let Ok(addr) = Self::address_of(to) else {
            return false;
        };
        let url = format!("http://{}{}/{}", addr, ENDPOINT_PING, to.id);

        match self.http_client.get(url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                tracing::debug!("Ping to {} failed: {}", to.id, e);
                false
            }
        }
    }
}
