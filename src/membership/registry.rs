use std::sync::Arc;

use super::types::{AliveMarker, ClusterNode, MarkerData, NodeId};
use crate::coordination::{self, CoordinationClient, CreateMode, StoreError, StoreResult, paths};

/// Reads and writes alive markers on behalf of one node.
///
/// Every node registers exactly one marker per session. The coordinator uses
/// the same registry to enumerate markers, and is the only caller of
/// [`MembershipRegistry::force_remove`].
pub struct MembershipRegistry {
    client: Arc<CoordinationClient>,
}

impl MembershipRegistry {
    pub fn new(client: Arc<CoordinationClient>) -> Self {
        Self { client }
    }

    /// Creates this node's ephemeral marker.
    ///
    /// # Returns
    /// * The marker, carrying the sequence allocated by the coordination service.
    pub async fn register(&self, node_id: &NodeId, client: bool) -> StoreResult<AliveMarker> {
        let data = MarkerData {
            client,
            acked_version: 0,
        };
        let name = self
            .client
            .create_sequential(
                paths::ALIVE,
                node_id.as_str(),
                coordination::encode(&data)?,
                CreateMode::Ephemeral,
            )
            .await?;

        let seq = paths::parse_sequence(&name).ok_or_else(|| StoreError::NoNode(name.clone()))?;
        tracing::debug!("Registered alive marker {} for {}", name, node_id);

        Ok(AliveMarker {
            seq,
            node_id: node_id.clone(),
            name,
            data,
        })
    }

    /// All alive markers sorted by sequence. Markers vanishing mid-read are skipped.
    pub async fn alive_markers(&self) -> StoreResult<Vec<AliveMarker>> {
        let mut markers = Vec::new();

        for name in self.client.children(paths::ALIVE).await? {
            let Some((seq, node_id)) = paths::parse_alive(&name) else {
                tracing::warn!("Ignoring malformed alive marker {}", name);
                continue;
            };
            let Some(stored) = self.client.get(&paths::alive(&name)).await? else {
                continue;
            };
            let data = match coordination::decode::<MarkerData>(&stored.data) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable alive marker {}: {}", name, e);
                    continue;
                }
            };
            markers.push(AliveMarker {
                seq,
                node_id,
                name,
                data,
            });
        }

        markers.sort_by_key(|marker| marker.seq);
        Ok(markers)
    }

    pub async fn marker_exists(&self, name: &str) -> StoreResult<bool> {
        self.client.exists(&paths::alive(name)).await
    }

    /// Publishes the highest acknowledged version on this node's marker.
    pub async fn update_ack(&self, marker: &AliveMarker, acked_version: u64) -> StoreResult<()> {
        let data = MarkerData {
            client: marker.data.client,
            acked_version,
        };
        self.client
            .set(&paths::alive(&marker.name), coordination::encode(&data)?, None)
            .await?;
        Ok(())
    }

    /// Removes this node's own marker.
    pub async fn remove(&self, marker: &AliveMarker) -> StoreResult<bool> {
        self.client.delete_if_exists(&paths::alive(&marker.name)).await
    }

    /// Deletes another node's marker. Reserved for the coordinator's forced-fail path.
    pub async fn force_remove(&self, marker_name: &str) -> StoreResult<bool> {
        tracing::warn!("Force removing alive marker {}", marker_name);
        self.client.delete_if_exists(&paths::alive(marker_name)).await
    }

    /// Coordinator among `markers`, given the members of the newest topology.
    ///
    /// The alive server member with the lowest order wins. Only when no member
    /// server is alive does the server marker with the lowest sequence take over;
    /// it admits itself before anyone else.
    pub fn coordinator<'a>(
        markers: &'a [AliveMarker],
        members: &[ClusterNode],
    ) -> Option<&'a AliveMarker> {
        let owned = |node: &ClusterNode| {
            markers
                .iter()
                .find(|marker| marker.seq == node.internal_order && marker.node_id == node.id)
        };

        let elected = members
            .iter()
            .filter(|node| node.is_server())
            .filter_map(|node| owned(node).map(|marker| (node.order, marker)))
            .min_by_key(|(order, _)| *order)
            .map(|(_, marker)| marker);

        elected.or_else(|| {
            markers
                .iter()
                .filter(|marker| !marker.is_client())
                .min_by_key(|marker| marker.seq)
        })
    }

    pub fn has_servers(markers: &[AliveMarker]) -> bool {
        markers.iter().any(|marker| !marker.is_client())
    }
}
