use crate::{AccountId, Collection, EntityId, Payload, Timestamp};
use serde::{Deserialize, Serialize};

/// A synchronized record identified by `(owner, collection, id)`.
///
/// The payload is opaque to the engine; connectors decide its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub owner: AccountId,
    pub collection: Collection,
    pub payload: Payload,
}

impl Entity {
    pub fn new(id: EntityId, owner: AccountId, collection: Collection, payload: Payload) -> Self {
        Self {
            id,
            owner,
            collection,
            payload,
        }
    }
}

/// The cached copy of one entity.
///
/// `synced` is false exactly while a local write for this entity has not been
/// confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub entity_id: EntityId,
    pub owner: AccountId,
    pub collection: Collection,
    pub payload: Payload,
    /// When this copy was written into the cache (drives expiry and eviction).
    pub captured_at: Timestamp,
    pub synced: bool,
    /// Modification time of the entity itself (server-assigned once confirmed).
    pub last_modified: Timestamp,
}

impl CacheEntry {
    /// A confirmed copy of a server record.
    pub fn synced(
        entity: Entity,
        last_modified: Timestamp,
        captured_at: Timestamp,
    ) -> Self {
        Self {
            entity_id: entity.id,
            owner: entity.owner,
            collection: entity.collection,
            payload: entity.payload,
            captured_at,
            synced: true,
            last_modified,
        }
    }
}
