use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::types::{DiscoveryEvent, EventType, TopologySnapshot};
use crate::coordination::{self, CoordinationClient, CreateMode, StoreResult, paths};
use crate::membership::types::{ClusterNode, NodeId};

/// One entry of the event journal, stored at `events/<version>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    pub version: u64,
    pub event_type: EventType,
    /// Node the event is about. For `Custom`, the sender.
    pub node: ClusterNode,
    /// Topology after the event.
    pub nodes: Vec<ClusterNode>,
    /// Highest order ever assigned, including departed nodes.
    pub max_order: u64,
    pub custom: Option<Vec<u8>>,
    pub reason: Option<String>,
}

impl JournalEntry {
    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot::new(self.version, self.nodes.clone())
    }

    pub fn to_event(&self) -> DiscoveryEvent {
        DiscoveryEvent {
            event_type: self.event_type,
            version: self.version,
            node: self.node.clone(),
            snapshot: Arc::new(self.snapshot()),
            custom: self.custom.clone(),
        }
    }

    /// Id of the node that departed with this entry, if any.
    pub fn departed(&self) -> Option<&NodeId> {
        match self.event_type {
            EventType::NodeLeft | EventType::NodeFailed => Some(&self.node.id),
            _ => None,
        }
    }
}

/// Ordered event log kept in the coordination service.
///
/// Only the coordinator appends. Appending creates `events/<version>`, so two
/// coordinators racing for the same version cannot both succeed.
pub struct EventJournal {
    client: Arc<CoordinationClient>,
}

impl EventJournal {
    pub fn new(client: Arc<CoordinationClient>) -> Self {
        Self { client }
    }

    /// Persists `entry`. Fails with `NodeExists` if its version was already written.
    pub async fn append(&self, entry: &JournalEntry) -> StoreResult<()> {
        let data = coordination::encode(entry)?;
        self.client
            .create(&paths::event(entry.version), data, CreateMode::Persistent)
            .await?;
        tracing::debug!(
            "Journal append v{} {:?} node={}",
            entry.version,
            entry.event_type,
            entry.node.id
        );
        Ok(())
    }

    /// Retained versions, ascending.
    pub async fn versions(&self) -> StoreResult<Vec<u64>> {
        let mut versions: Vec<u64> = self
            .client
            .children(paths::EVENTS)
            .await?
            .iter()
            .filter_map(|name| paths::parse_event(name))
            .collect();
        versions.sort_unstable();
        Ok(versions)
    }

    pub async fn read(&self, version: u64) -> StoreResult<Option<JournalEntry>> {
        match self.client.get(&paths::event(version)).await? {
            Some(stored) => coordination::decode(&stored.data).map(Some),
            None => Ok(None),
        }
    }

    /// Retained entries with a version greater than `after`, ascending.
    pub async fn read_from(&self, after: u64) -> StoreResult<Vec<JournalEntry>> {
        let mut entries = Vec::new();
        for version in self.versions().await? {
            if version <= after {
                continue;
            }
            // Collected between listing and reading
            if let Some(entry) = self.read(version).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Newest retained entry.
    pub async fn tail(&self) -> StoreResult<Option<JournalEntry>> {
        for version in self.versions().await?.into_iter().rev() {
            if let Some(entry) = self.read(version).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Deletes entries with a version up to `floor`. The newest entry is always kept
    /// so a new coordinator can resume from it.
    ///
    /// # Returns
    /// * The number of deleted entries.
    pub async fn collect_garbage(&self, floor: u64) -> StoreResult<usize> {
        let versions = self.versions().await?;
        let Some(&newest) = versions.last() else {
            return Ok(0);
        };

        let mut removed = 0;
        for version in versions {
            if version > floor || version == newest {
                break;
            }
            if self.client.delete_if_exists(&paths::event(version)).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::debug!("Journal collected {} entries up to v{}", removed, floor);
        }
        Ok(removed)
    }

    pub async fn retained_count(&self) -> StoreResult<usize> {
        Ok(self.versions().await?.len())
    }

    pub async fn oldest_version(&self) -> StoreResult<Option<u64>> {
        Ok(self.versions().await?.first().copied())
    }
}
