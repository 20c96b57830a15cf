//! Catalog change notifications
//!
//! A [`CatalogEvent`] goes out only after the transaction behind it has
//! committed, so a subscriber never hears about a change that was rolled
//! back. Delivery is best effort: a subscriber that falls behind the
//! channel capacity loses the oldest events, and the ledger stays the
//! record of truth.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::models::{ChangeKind, ItemId, PermissionLevel, UserId};

/// Catalog events emitted by services
#[derive(Debug, Clone)]
pub enum CatalogEvent {
    // Identity events
    ItemResolved {
        item_id: ItemId,
        created: bool,
        source_id: String,
    },

    // List events
    ListCreated {
        list_id: ItemId,
        owner_id: UserId,
        title: String,
    },
    ListChanged {
        list_id: ItemId,
        actor: UserId,
        version: i64,
        kinds: Vec<ChangeKind>,
    },
    ListDeleted {
        list_id: ItemId,
        actor: UserId,
    },
    SmartListRefreshed {
        list_id: ItemId,
        item_count: u32,
    },

    // Sharing events
    CollaboratorGranted {
        list_id: ItemId,
        user_id: UserId,
        level: PermissionLevel,
    },
    CollaboratorRevoked {
        list_id: ItemId,
        user_id: UserId,
    },
}

/// Receives every event delivered to a subscription
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &CatalogEvent);
}

/// Fan-out of catalog events to any number of subscribers
pub struct EventBus {
    sender: broadcast::Sender<CatalogEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `capacity` is how many events a slow subscriber may trail by
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: CatalogEvent) {
        trace!(event = ?event, "Emitting catalog event");
        // Err only means nobody is subscribed
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CatalogEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes each event to the `debug` log
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &CatalogEvent) {
        match event {
            CatalogEvent::ItemResolved {
                item_id,
                created,
                source_id,
            } => debug!(item_id, created, source = %source_id, "Item resolved"),
            CatalogEvent::ListCreated {
                list_id,
                owner_id,
                title,
            } => debug!(list_id, owner_id, title = %title, "List created"),
            CatalogEvent::ListChanged {
                list_id,
                actor,
                version,
                kinds,
            } => debug!(list_id, actor, version, changes = kinds.len(), "List changed"),
            CatalogEvent::ListDeleted { list_id, actor } => {
                debug!(list_id, actor, "List deleted")
            }
            CatalogEvent::SmartListRefreshed {
                list_id,
                item_count,
            } => debug!(list_id, item_count, "Smart list refreshed"),
            CatalogEvent::CollaboratorGranted {
                list_id,
                user_id,
                level,
            } => debug!(list_id, user_id, level = level.as_str(), "Collaborator granted"),
            CatalogEvent::CollaboratorRevoked { list_id, user_id } => {
                debug!(list_id, user_id, "Collaborator revoked")
            }
        }
    }
}

/// Log every event on a background task.
///
/// The task holds only a receiver, so it ends once the last handle to the
/// bus is dropped.
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    drop(event_bus);

    tokio::spawn(async move {
        let listener = LoggingEventListener;
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "Logging listener fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
