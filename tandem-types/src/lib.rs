//! Core type definitions for Tandem.
//!
//! This crate defines the payload-agnostic types shared by every layer of the
//! sync engine:
//! - Account, entity, operation and subscription identifiers
//! - The closed set of synchronized collections
//! - Entities, cache entries and the `SyncEvent` delivered to subscribers
//! - Millisecond timestamps and an injectable clock
//!
//! Payloads are open JSON maps. Nothing here knows what an activity or a rule
//! looks like; that belongs to the connectors producing them.

mod collection;
mod entity;
mod event;
mod ids;
mod payload;
mod timestamp;

pub use collection::Collection;
pub use entity::{CacheEntry, Entity};
pub use event::{ChangeKind, EventOrigin, SyncEvent};
pub use ids::{AccountId, EntityId, OperationId, SubscriptionId, TEMP_ID_PREFIX};
pub use payload::{Payload, merge_patch, merged};
pub use timestamp::{Clock, ManualClock, SystemClock, Timestamp};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
