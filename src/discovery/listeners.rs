//! Listener Registry
//!
//! Maps opaque subscription ids to event handlers, each with the set of event types
//! it wants. Handlers run on the node's event task, in version order. A panicking
//! handler is logged and skipped; the others still run.

use super::types::{DiscoveryEvent, EventMask};

use dashmap::DashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Type alias for a thread-safe event handler.
pub type EventHandlerFn = Arc<dyn Fn(&DiscoveryEvent) + Send + Sync>;

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    mask: EventMask,
    handler: EventHandlerFn,
}

pub struct ListenerRegistry {
    subscriptions: DashMap<SubscriptionId, Subscription>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    /// Creates a new, empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a handler for the event types in `mask`.
    ///
    /// # Arguments
    /// * `mask` - Event types the handler is called for.
    /// * `handler` - Called once per matching event.
    pub fn register<F>(&self, mask: EventMask, handler: F) -> SubscriptionId
    where
        F: Fn(&DiscoveryEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.insert(
            id,
            Subscription {
                mask,
                handler: Arc::new(handler),
            },
        );
        tracing::debug!("Registered discovery listener {:?} ({:?})", id, mask);
        id
    }

    /// Removes a subscription. Returns false if it was unknown.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Calls every handler subscribed to the event's type.
    ///
    /// # Returns
    /// * The number of handlers that completed without panicking.
    pub fn notify(&self, event: &DiscoveryEvent) -> usize {
        // Handlers may (un)register listeners, so don't hold map guards while calling them
        let mut targets: Vec<(SubscriptionId, EventHandlerFn)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().mask.contains(event.event_type))
            .map(|entry| (*entry.key(), entry.value().handler.clone()))
            .collect();
        targets.sort_by_key(|(id, _)| *id);

        let mut delivered = 0;
        for (id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(
                        "Discovery listener {:?} panicked on {}: {}",
                        id,
                        event,
                        message
                    );
                }
            }
        }
        delivered
    }

    /// Returns the total number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.subscriptions.len()
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self {
            subscriptions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }
}
