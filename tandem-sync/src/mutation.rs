//! Mutation records, handles and outcomes.

use crate::config::ConflictPolicy;
use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use tandem_types::{CacheEntry, Collection, EntityId, OperationId, Payload, SyncEvent, Timestamp};
use tokio::sync::oneshot;

/// What a mutation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a mutation.
///
/// `PendingLocal` covers the optimistic write, every retry and time spent in
/// the offline outbox. `Failed` mutations stay unsynced in the cache until the
/// caller rolls them back or a resync replays them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    PendingLocal,
    Confirmed,
    Failed,
    RolledBack,
}

/// Successful result of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationReceipt {
    pub operation_id: OperationId,
    /// The real id; for creates, the id assigned by the server.
    pub entity_id: EntityId,
    /// Server payload after the write, empty for deletes.
    pub payload: Payload,
    pub last_modified: Timestamp,
    /// Set when a conflict was detected and resolved with this policy.
    pub conflict: Option<ConflictPolicy>,
}

/// Resolves once the mutation is confirmed or has failed.
#[derive(Debug)]
pub struct MutationHandle {
    operation_id: OperationId,
    rx: oneshot::Receiver<SyncResult<MutationReceipt>>,
}

impl MutationHandle {
    pub(crate) fn new(
        operation_id: OperationId,
    ) -> (Self, oneshot::Sender<SyncResult<MutationReceipt>>) {
        let (tx, rx) = oneshot::channel();
        (Self { operation_id, rx }, tx)
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Waits for the mutation to resolve.
    pub async fn wait(self) -> SyncResult<MutationReceipt> {
        self.rx.await.map_err(|_| SyncError::ChannelClosed)?
    }
}

/// Handle for a create: the temporary id is usable immediately.
#[derive(Debug)]
pub struct CreateHandle {
    pub temp_id: EntityId,
    pub handle: MutationHandle,
}

impl CreateHandle {
    pub fn operation_id(&self) -> OperationId {
        self.handle.operation_id()
    }

    /// Waits for the create to resolve; the receipt carries the real id.
    pub async fn wait(self) -> SyncResult<MutationReceipt> {
        self.handle.wait().await
    }
}

/// A mutation accepted by the coordinator together with the local event
/// describing its optimistic write.
#[derive(Debug)]
pub struct Submitted<H> {
    pub handle: H,
    pub event: SyncEvent,
}

/// Report of a mutation leaving the pending state.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub operation_id: OperationId,
    pub kind: MutationKind,
    pub state: MutationState,
    pub collection: Collection,
    /// Final id of the entity (the real id for confirmed creates).
    pub entity_id: EntityId,
    /// The temporary id a confirmed create replaced.
    pub previous_id: Option<EntityId>,
    /// Cache state after resolution, if the entity is cached.
    pub entry: Option<CacheEntry>,
    /// Events to publish: the confirmation itself followed by any server
    /// events that were held back while the mutation was pending.
    pub events: Vec<SyncEvent>,
    pub error: Option<SyncError>,
}

/// Notifications from the coordinator to its owner.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    Resolved(MutationOutcome),
    /// An outbox flush finished.
    OutboxFlushed { committed: usize, failed: usize },
}

/// A queued mutation.
#[derive(Debug)]
pub(crate) struct PendingMutation {
    pub seq: u64,
    pub id: OperationId,
    pub kind: MutationKind,
    pub collection: Collection,
    /// Current target id, rewritten when a temporary id resolves.
    pub target: EntityId,
    /// Full payload for creates, the patch for updates, empty for deletes.
    pub payload: Payload,
    /// View the caller based the write on; restored on rollback.
    pub snapshot: Option<CacheEntry>,
    /// Server modification time the write is based on. A newer server copy
    /// is a conflict.
    pub base: Option<Timestamp>,
    /// Parked in the offline outbox.
    pub parked: bool,
    /// Handed to the remote store at least once.
    pub sent: bool,
    pub reply: Option<oneshot::Sender<SyncResult<MutationReceipt>>>,
}

impl PendingMutation {
    pub fn job(&self) -> Job {
        Job {
            seq: self.seq,
            id: self.id,
            kind: self.kind,
            collection: self.collection,
            target: self.target.clone(),
            payload: self.payload.clone(),
            snapshot: self.snapshot.clone(),
            base: self.base,
        }
    }
}

/// Snapshot of a pending mutation taken when it is sent.
#[derive(Debug, Clone)]
pub(crate) struct Job {
    pub seq: u64,
    pub id: OperationId,
    pub kind: MutationKind,
    pub collection: Collection,
    pub target: EntityId,
    pub payload: Payload,
    pub snapshot: Option<CacheEntry>,
    pub base: Option<Timestamp>,
}

/// A failed mutation kept for rollback or replay.
#[derive(Debug, Clone)]
pub(crate) struct FailedMutation {
    pub seq: u64,
    pub kind: MutationKind,
    pub collection: Collection,
    pub target: EntityId,
    /// The patch for updates, the full payload for creates.
    pub payload: Payload,
    pub snapshot: Option<CacheEntry>,
    pub base: Option<Timestamp>,
}

impl From<&Job> for FailedMutation {
    fn from(job: &Job) -> Self {
        Self {
            seq: job.seq,
            kind: job.kind,
            collection: job.collection,
            target: job.target.clone(),
            payload: job.payload.clone(),
            snapshot: job.snapshot.clone(),
            base: job.base,
        }
    }
}

/// A mutation as requested, before it is queued.
#[derive(Debug)]
pub(crate) struct Request {
    pub kind: MutationKind,
    pub collection: Collection,
    pub target: EntityId,
    pub payload: Payload,
    pub snapshot: Option<CacheEntry>,
    pub base: Option<Timestamp>,
}

impl Request {
    /// A request based on `snapshot`. Only a confirmed snapshot carries a
    /// server timestamp to check conflicts against.
    pub fn new(
        kind: MutationKind,
        collection: Collection,
        target: EntityId,
        payload: Payload,
        snapshot: Option<CacheEntry>,
    ) -> Self {
        let base = snapshot
            .as_ref()
            .filter(|s| s.synced)
            .map(|s| s.last_modified);
        Self {
            kind,
            collection,
            target,
            payload,
            snapshot,
            base,
        }
    }
}
