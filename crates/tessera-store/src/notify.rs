//! In-process fan-out of store change notifications.
//!
//! Every commit, reset and rekey publishes a [`StoreEvent`] so other readers
//! sharing the same durable store drop cached indices. Events carry no data
//! beyond the kind and provider slug.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity. Lagging receivers treat a lag as a full invalidation.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Kind of change that happened to the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreEvent {
    /// The store was claimed or wiped under a new key.
    Rekey,
    /// A provider was reset.
    Reset,
    /// A provider index was committed.
    Write {
        /// Provider slug
        provider: String,
    },
}

/// Broadcast bus shared by every handle onto one logical store.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
}

impl EventBus {
    /// Creates a bus with room for `capacity` undelivered events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event. Returns the number of receivers it reached.
    pub fn publish(&self, event: StoreEvent) -> usize {
        trace!(?event, "store event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Current number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
