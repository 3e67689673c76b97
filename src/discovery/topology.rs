use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

use super::journal::JournalEntry;
use super::types::{DiscoveryEvent, EventType, TopologySnapshot};
use crate::membership::types::ClusterNode;

/// A node's local copy of the topology.
///
/// Journal entries are applied strictly in version order. Entries arriving ahead of
/// the next expected version are buffered; entries at or below the applied version
/// are ignored, so redelivery is harmless. Snapshots are immutable and swapped
/// whole on every application.
pub struct LocalTopology {
    current: RwLock<Arc<TopologySnapshot>>,
    pending: Mutex<BTreeMap<u64, JournalEntry>>,
    history: Mutex<VecDeque<DiscoveryEvent>>,
    history_limit: usize,
    version_tx: watch::Sender<u64>,
}

impl LocalTopology {
    pub fn new(history_limit: usize) -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            current: RwLock::new(Arc::new(TopologySnapshot::default())),
            pending: Mutex::new(BTreeMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit,
            version_tx,
        }
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Notified with the applied version after every change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version_tx.subscribe()
    }

    /// Replaces the topology wholesale, dropping buffered entries. Used when joining.
    pub fn reset(&self, snapshot: TopologySnapshot) {
        let version = snapshot.version;
        *self.current.write() = Arc::new(snapshot);
        self.pending.lock().retain(|v, _| *v > version);
        self.version_tx.send_replace(version);
    }

    /// Offers a journal entry.
    ///
    /// # Returns
    /// * The events that became applicable, in version order. Empty when the entry was
    ///   a duplicate or is buffered behind a gap.
    pub fn offer(&self, entry: JournalEntry) -> Vec<DiscoveryEvent> {
        let mut pending = self.pending.lock();
        let mut current = self.current.write();

        if entry.version <= current.version || pending.contains_key(&entry.version) {
            return Vec::new();
        }
        pending.insert(entry.version, entry);

        let mut applied = Vec::new();
        while let Some(next) = pending.remove(&(current.version + 1)) {
            let event = next.to_event();
            *current = event.snapshot.clone();
            applied.push(event);
        }
        drop(pending);

        if !applied.is_empty() {
            let version = current.version;
            drop(current);
            self.remember(&applied);
            self.version_tx.send_replace(version);
        }
        applied
    }

    /// Version of the oldest buffered entry, if any.
    pub fn first_pending(&self) -> Option<u64> {
        self.pending.lock().keys().next().copied()
    }

    /// Builds a local event against the current snapshot and records it.
    pub fn local_event(&self, event_type: EventType, node: ClusterNode) -> DiscoveryEvent {
        let snapshot = self.snapshot();
        let event = DiscoveryEvent {
            event_type,
            version: snapshot.version,
            node,
            snapshot,
            custom: None,
        };
        self.remember(std::slice::from_ref(&event));
        event
    }

    /// Recent events, oldest first.
    pub fn history(&self) -> Vec<DiscoveryEvent> {
        self.history.lock().iter().cloned().collect()
    }

    fn remember(&self, events: &[DiscoveryEvent]) {
        if self.history_limit == 0 {
            return;
        }
        let mut history = self.history.lock();
        for event in events {
            if history.len() == self.history_limit {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
    }
}
