//! Change notifications delivered to subscribers.
//!
//! A `SyncEvent` is the single unit that flows from the push channels, the
//! cache bootstrap and local optimistic writes to whoever subscribed to a
//! collection. The `origin` tells the receiver which of those three views
//! produced it.

use crate::{CacheEntry, Collection, EntityId, Payload, Timestamp};
use serde::{Deserialize, Serialize};

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Which view of the entity produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    /// Live push from the remote store.
    Server,
    /// An optimistic local write or its rollback.
    Local,
    /// Replay of the durable cache on subscribe.
    Cache,
}

/// A change to one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub kind: ChangeKind,
    pub collection: Collection,
    pub entity_id: EntityId,
    /// Full payload after the change; empty for removals.
    pub payload: Payload,
    /// Server timestamp for server events, local time otherwise.
    pub timestamp: Timestamp,
    pub origin: EventOrigin,
}

impl SyncEvent {
    #[must_use]
    pub fn new(
        kind: ChangeKind,
        collection: Collection,
        entity_id: EntityId,
        payload: Payload,
        timestamp: Timestamp,
        origin: EventOrigin,
    ) -> Self {
        Self {
            kind,
            collection,
            entity_id,
            payload,
            timestamp,
            origin,
        }
    }

    /// Creates a removal event.
    #[must_use]
    pub fn removed(
        collection: Collection,
        entity_id: EntityId,
        timestamp: Timestamp,
        origin: EventOrigin,
    ) -> Self {
        Self::new(
            ChangeKind::Removed,
            collection,
            entity_id,
            Payload::new(),
            timestamp,
            origin,
        )
    }

    /// Describes a cache entry as an event of the given kind and origin.
    #[must_use]
    pub fn from_entry(entry: &CacheEntry, kind: ChangeKind, origin: EventOrigin) -> Self {
        Self::new(
            kind,
            entry.collection,
            entry.entity_id.clone(),
            entry.payload.clone(),
            entry.last_modified,
            origin,
        )
    }

    #[must_use]
    pub fn is_removal(&self) -> bool {
        self.kind == ChangeKind::Removed
    }
}
