//! Event bus for mission observers.
//!
//! Tokio broadcast fan-out with optional persistence to the store's event
//! column family. Dashboards subscribe; the controller publishes. Losing
//! a subscriber never blocks the pipeline.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::MissionEvent;
use crate::store::SharedStore;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Shared reference to the event bus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channels and optional persistence
pub struct EventBus {
    sender: broadcast::Sender<MissionEvent>,
    store: Option<SharedStore>,
}

impl EventBus {
    /// Create a new event bus without persistence
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: None,
        }
    }

    /// Create an event bus that also writes every event to the store
    pub fn with_persistence(store: SharedStore) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            store: Some(store),
        }
    }

    /// Create a shared reference to this bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers.
    ///
    /// Persistence failures are logged and swallowed; an event stream gap
    /// is preferable to stalling integration.
    pub fn publish(&self, event: MissionEvent) {
        let event_type = event.event_type();

        if let Some(store) = &self.store {
            let nanos = event.timestamp().timestamp_nanos_opt().unwrap_or(0);
            if let Err(e) = store.put_event(nanos, &MissionEvent::new_id(), &event) {
                warn!(event_type, error = %e, "failed to persist event");
            }
        }

        match self.sender.send(event) {
            Ok(count) => debug!(event_type, receivers = count, "event published"),
            // No receivers is fine; persistence (if any) already happened.
            Err(_) => debug!(event_type, "event published (no receivers)"),
        }
    }

    /// Subscribe to receive events
    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.sender.subscribe()
    }

    /// Number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
