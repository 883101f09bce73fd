//! Domain event system: decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens to cached
//! configuration or conversation state. Diagnostics and request handlers can
//! subscribe without the publishers knowing about them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// Cache entries were dropped outside a full refresh
    CacheInvalidated {
        scope: String,
        entries_removed: usize,
        timestamp: DateTime<Utc>,
    },

    /// A full cache refresh finished
    CacheRefreshed {
        success: bool,
        instructions_reloaded: usize,
        errors: usize,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// An agent's history was saved on an agent switch
    ContextSaved {
        session_id: String,
        actor_id: String,
        turns: usize,
        timestamp: DateTime<Utc>,
    },

    /// A best-effort durable write failed and was dropped
    PersistenceFailed {
        session_id: String,
        actor_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
