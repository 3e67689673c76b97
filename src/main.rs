use axum::Json;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use clap::Parser;
use cluster_discovery::config::DiscoveryConfig;
use cluster_discovery::coordination::{CoordinationStore, MemoryEnsemble};
use cluster_discovery::discovery::{DiscoveryNode, EventMask, NodeSpec, TopologySnapshot};
use cluster_discovery::membership::types::NodeId;
use cluster_discovery::transport::HttpTransport;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Runs a sandbox cluster in one process: an in-memory coordination ensemble,
/// HTTP transport between nodes and an admin API to poke at the topology.
#[derive(Debug, Parser)]
#[command(name = "cluster-discovery", version)]
struct Args {
    /// Number of server nodes
    #[arg(long, default_value_t = 3)]
    servers: usize,

    /// Number of client nodes
    #[arg(long, default_value_t = 2)]
    clients: usize,

    /// TOML file with discovery settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Interface the node transports listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    host: IpAddr,

    /// Address of the admin API
    #[arg(long, default_value = "127.0.0.1:8080")]
    admin: SocketAddr,
}

/// Nodes started by the sandbox, in start order.
struct Sandbox {
    nodes: Vec<Arc<DiscoveryNode>>,
}

impl Sandbox {
    /// First node still in the cluster; answers admin queries.
    fn observer(&self) -> Option<&Arc<DiscoveryNode>> {
        self.nodes
            .iter()
            .find(|node| !node.is_stopped() && node.local_node().is_some())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => DiscoveryConfig::load(path)?,
        None => DiscoveryConfig::default(),
    };
    config.validate()?;

    tracing::info!(
        "Starting sandbox with {} servers and {} clients under {}",
        args.servers,
        args.clients,
        config.root_path
    );

    // 1. Coordination service and transport:
    let ensemble: Arc<dyn CoordinationStore> = Arc::new(MemoryEnsemble::new());
    let transport = HttpTransport::new(args.host);

    // 2. Nodes:
    let mut nodes = Vec::with_capacity(args.servers + args.clients);
    let specs = (0..args.servers)
        .map(|_| NodeSpec::server(config.clone()))
        .chain((0..args.clients).map(|_| NodeSpec::client(config.clone())));

    for spec in specs {
        let node = DiscoveryNode::new(spec, ensemble.clone(), transport.clone());
        let observer = node.id();
        node.local_listen(EventMask::ALL, move |event| {
            if event.event_type.changes_topology() || event.event_type.is_local() {
                tracing::info!("[{}] {}", observer, event);
            } else {
                tracing::debug!("[{}] {}", observer, event);
            }
        });
        node.join().await?;
        nodes.push(node);
    }
    let sandbox = Arc::new(Sandbox { nodes });

    // 3. Admin router:
    let app = Router::new()
        .route("/topology", get(handle_topology))
        .route("/nodes/:id/ping", get(handle_ping))
        .route("/nodes/:id/fail", post(handle_fail))
        .route("/custom", post(handle_custom))
        .layer(Extension(sandbox.clone()));

    // 4. Spawn stats reporter:
    let stats = sandbox.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let Some(observer) = stats.observer() else {
                tracing::warn!("No node of the sandbox is in the cluster");
                continue;
            };
            let topology = observer.topology();
            tracing::info!(
                "Cluster stats: {} nodes at version {}",
                topology.len(),
                topology.version
            );
            for node in &topology.nodes {
                tracing::info!(
                    "  - {} order={} client={}",
                    node.id,
                    node.order,
                    node.client
                );
            }
        }
    });

    // 5. Start admin server:
    tracing::info!("Admin API listening on {}", args.admin);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(args.admin).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await?;

    for node in sandbox.nodes.iter().rev() {
        if let Err(e) = node.stop().await {
            tracing::warn!("Node {} did not stop cleanly: {}", node.id(), e);
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PingResult {
    node_id: String,
    alive: bool,
}

#[derive(Debug, Deserialize)]
struct FailRequest {
    reason: Option<String>,
}

/// Custom event body; the payload is published as its JSON encoding.
#[derive(Debug, Deserialize)]
struct CustomRequest {
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct AdminResponse {
    success: bool,
    error: Option<String>,
}

impl AdminResponse {
    fn from_result<E: std::fmt::Display>(result: Result<(), E>) -> (StatusCode, Json<Self>) {
        match result {
            Ok(()) => (
                StatusCode::OK,
                Json(Self {
                    success: true,
                    error: None,
                }),
            ),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Self {
                    success: false,
                    error: Some(e.to_string()),
                }),
            ),
        }
    }

    fn unavailable() -> (StatusCode, Json<Self>) {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(Self {
                success: false,
                error: Some("no node of the sandbox is in the cluster".to_string()),
            }),
        )
    }
}

async fn handle_topology(
    Extension(sandbox): Extension<Arc<Sandbox>>,
) -> (StatusCode, Json<TopologySnapshot>) {
    match sandbox.observer() {
        Some(node) => (StatusCode::OK, Json((*node.topology()).clone())),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(TopologySnapshot::default()),
        ),
    }
}

async fn handle_ping(
    Extension(sandbox): Extension<Arc<Sandbox>>,
    Path(id): Path<String>,
) -> (StatusCode, Json<PingResult>) {
    let alive = match sandbox.observer() {
        Some(node) => node.ping_node(&NodeId(id.clone())).await,
        None => false,
    };
    (StatusCode::OK, Json(PingResult { node_id: id, alive }))
}

async fn handle_fail(
    Extension(sandbox): Extension<Arc<Sandbox>>,
    Path(id): Path<String>,
    Json(req): Json<FailRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    let Some(node) = sandbox.observer() else {
        return AdminResponse::unavailable();
    };
    let reason = req.reason.unwrap_or_else(|| "admin request".to_string());
    tracing::info!("Admin requested failure of {}: {}", id, reason);
    AdminResponse::from_result(node.fail_node(&NodeId(id), &reason).await)
}

async fn handle_custom(
    Extension(sandbox): Extension<Arc<Sandbox>>,
    Json(req): Json<CustomRequest>,
) -> (StatusCode, Json<AdminResponse>) {
    let Some(node) = sandbox.observer() else {
        return AdminResponse::unavailable();
    };
    let payload = match serde_json::to_vec(&req.payload) {
        Ok(payload) => payload,
        Err(e) => return AdminResponse::from_result(Err(e)),
    };
    AdminResponse::from_result(node.send_custom(payload).await)
}
