//! The remote store trait and the records it exchanges.

use crate::error::RemoteResult;
use crate::query::Query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tandem_types::{AccountId, ChangeKind, Collection, EntityId, Payload, Timestamp};
use tokio::sync::mpsc;

/// The authoritative copy of one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: EntityId,
    pub payload: Payload,
    /// Server-assigned modification time.
    pub last_modified: Timestamp,
}

/// One change notification from a push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub id: EntityId,
    /// Record payload after the change; empty for removals.
    pub payload: Payload,
    pub last_modified: Timestamp,
    /// Server sequence number, strictly increasing per store.
    pub sequence: u64,
}

/// Live change feed of a subscription.
///
/// An `Err` item or the feed closing means the subscription was dropped by
/// the server; the consumer decides whether to resubscribe.
pub type ChangeFeed = mpsc::Receiver<RemoteResult<RemoteChange>>;

/// A single write against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RemoteWrite {
    /// Create a record; the server assigns its id.
    Create {
        collection: Collection,
        payload: Payload,
    },
    /// Shallow-merge `patch` into the record, creating it if missing.
    Update {
        collection: Collection,
        id: EntityId,
        patch: Payload,
    },
    /// Overwrite the record's payload entirely.
    Replace {
        collection: Collection,
        id: EntityId,
        payload: Payload,
    },
    /// Delete the record. Deleting a missing record succeeds.
    Delete { collection: Collection, id: EntityId },
}

impl RemoteWrite {
    pub fn collection(&self) -> Collection {
        match self {
            RemoteWrite::Create { collection, .. }
            | RemoteWrite::Update { collection, .. }
            | RemoteWrite::Replace { collection, .. }
            | RemoteWrite::Delete { collection, .. } => *collection,
        }
    }

    /// The record this write targets, `None` for creates.
    pub fn target(&self) -> Option<&EntityId> {
        match self {
            RemoteWrite::Create { .. } => None,
            RemoteWrite::Update { id, .. }
            | RemoteWrite::Replace { id, .. }
            | RemoteWrite::Delete { id, .. } => Some(id),
        }
    }

    /// Short name for logging.
    pub fn label(&self) -> &'static str {
        match self {
            RemoteWrite::Create { .. } => "create",
            RemoteWrite::Update { .. } => "update",
            RemoteWrite::Replace { .. } => "replace",
            RemoteWrite::Delete { .. } => "delete",
        }
    }
}

/// Result of an applied write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOutcome {
    /// The record as stored after the write.
    Written(RemoteRecord),
    /// The record was deleted.
    Deleted { id: EntityId, at: Timestamp },
}

/// The backing service the engine synchronizes with.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Opens a push subscription.
    ///
    /// Without `resume_after` the feed starts with every matching record as
    /// an `Added` change. With it, the feed replays the changes recorded after
    /// that sequence number, then continues live.
    async fn subscribe(&self, query: &Query, resume_after: Option<u64>) -> RemoteResult<ChangeFeed>;

    /// Reads one record.
    async fn get(
        &self,
        account: &AccountId,
        collection: Collection,
        id: &EntityId,
    ) -> RemoteResult<Option<RemoteRecord>>;

    /// Applies a single write.
    async fn write(&self, account: &AccountId, write: RemoteWrite) -> RemoteResult<WriteOutcome>;

    /// Applies all writes atomically, in order. Either every write is applied
    /// or none is.
    async fn commit_batch(
        &self,
        account: &AccountId,
        writes: Vec<RemoteWrite>,
    ) -> RemoteResult<Vec<WriteOutcome>>;
}
