//! Default communication problem resolver.
//!
//! Two nodes are connected when each reported the other as reachable. The resolver
//! keeps the largest set of pairwise connected servers and kills every other
//! server. Candidate sets are grown greedily, one per server taken as seed in
//! topology order. Between sets of equal size, the one whose lowest-order member is
//! older wins, so the higher-order side of an even split is evicted. A client
//! survives only if it is connected to every kept server.

use anyhow::Result;

use super::{CommunicationProblemContext, CommunicationProblemResolver, ConnectivityMatrix};
use crate::membership::types::ClusterNode;

pub struct DefaultResolver;

impl DefaultResolver {
    fn grow_clique<'a>(
        seed: &'a ClusterNode,
        servers: &[&'a ClusterNode],
        matrix: &ConnectivityMatrix,
    ) -> Vec<&'a ClusterNode> {
        let mut clique = vec![seed];
        for candidate in servers {
            if candidate.id == seed.id {
                continue;
            }
            if clique
                .iter()
                .all(|member| matrix.mutually_connected(&member.id, &candidate.id))
            {
                clique.push(candidate);
            }
        }
        clique.sort_by_key(|node| node.order);
        clique
    }

    fn better(candidate: &[&ClusterNode], best: &[&ClusterNode]) -> bool {
        if candidate.len() != best.len() {
            return candidate.len() > best.len();
        }
        let orders = |nodes: &[&ClusterNode]| nodes.iter().map(|n| n.order).collect::<Vec<_>>();
        orders(candidate) < orders(best)
    }
}

impl CommunicationProblemResolver for DefaultResolver {
    fn name(&self) -> &str {
        "default"
    }

    fn resolve(&self, ctx: &mut CommunicationProblemContext) -> Result<()> {
        let topology = ctx.topology().clone();
        let matrix = ctx.connectivity().clone();
        let servers = topology.servers();

        if servers.is_empty() {
            tracing::info!("Default resolver: no servers among participants, nothing to do");
            return Ok(());
        }

        let mut best: Vec<&ClusterNode> = Vec::new();
        for seed in &servers {
            // A node that did not report cannot prove it reaches anyone
            if !matrix.has_report(&seed.id) && servers.len() > 1 {
                continue;
            }
            let clique = Self::grow_clique(seed, &servers, &matrix);
            if best.is_empty() || Self::better(&clique, &best) {
                best = clique;
            }
        }
        if best.is_empty() {
            best.push(servers[0]);
        }

        let mut kills = Vec::new();
        for node in &topology.nodes {
            let keep = if node.client {
                best.iter()
                    .all(|server| matrix.mutually_connected(&server.id, &node.id))
            } else {
                best.iter().any(|server| server.id == node.id)
            };
            if !keep {
                kills.push(node.id.clone());
            }
        }

        tracing::info!(
            "Default resolver keeps {} server(s), kills {} node(s)",
            best.len(),
            kills.len()
        );
        for id in &kills {
            ctx.kill_node(id);
        }
        Ok(())
    }
}
