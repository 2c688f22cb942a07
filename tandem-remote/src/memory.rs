//! In-memory remote store.
//!
//! Behaves like the real backing service from the engine's point of view:
//! server-assigned ids and timestamps, a global change sequence, resumable
//! push feeds and atomic batches. It also exposes controls to simulate other
//! devices writing, outages, injected failures and revoked permissions.

use crate::error::{RemoteError, RemoteResult};
use crate::query::Query;
use crate::store::{ChangeFeed, RemoteChange, RemoteRecord, RemoteStore, RemoteWrite, WriteOutcome};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tandem_types::{
    AccountId, ChangeKind, Clock, Collection, EntityId, Payload, SystemClock, Timestamp, merged,
};
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered changes per feed before the server drops a slow consumer.
const FEED_CAPACITY: usize = 256;

/// A client write as received by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteLogEntry {
    pub account: AccountId,
    /// Batch number for writes that arrived through `commit_batch`.
    pub batch: Option<u64>,
    pub write: RemoteWrite,
}

#[derive(Debug, Clone)]
struct LoggedChange {
    account: AccountId,
    collection: Collection,
    change: RemoteChange,
}

struct Feed {
    query: Query,
    tx: mpsc::Sender<RemoteResult<RemoteChange>>,
}

type PartitionKey = (AccountId, Collection);

#[derive(Default)]
struct State {
    records: HashMap<PartitionKey, BTreeMap<EntityId, (RemoteRecord, u64)>>,
    changes: Vec<LoggedChange>,
    feeds: Vec<Feed>,
    sequence: u64,
    last_stamp: u64,
    next_id: u64,
    unreachable: bool,
    injected: VecDeque<RemoteError>,
    revoked: HashSet<PartitionKey>,
    writes: Vec<WriteLogEntry>,
    batches: u64,
}

/// An in-process [`RemoteStore`].
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    /// Creates an empty store stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store whose timestamps come from `clock`.
    /// Stamps are still strictly increasing even if the clock stands still.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Simulation controls ──────────────────────────────────────

    /// Takes the store offline or back online. Going offline fails every open
    /// feed with `Unavailable`.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.unreachable = !reachable;
        if !reachable {
            for feed in state.feeds.drain(..) {
                let _ = feed
                    .tx
                    .try_send(Err(RemoteError::Unavailable("connection lost".into())));
            }
        }
    }

    pub fn is_reachable(&self) -> bool {
        !self.lock().unreachable
    }

    /// Queues errors returned by the next writes or batch commits, one per call.
    pub fn inject_failures(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.lock().injected.extend(errors);
    }

    /// Revokes access to a collection: matching feeds fail with
    /// `PermissionDenied` and later subscriptions or writes are refused.
    pub fn revoke(&self, account: &AccountId, collection: Collection) {
        let mut state = self.lock();
        state.revoked.insert((account.clone(), collection));
        state.feeds.retain(|feed| {
            if feed.query.account == *account && feed.query.collection == collection {
                let _ = feed
                    .tx
                    .try_send(Err(RemoteError::PermissionDenied(format!(
                        "access to {collection} revoked"
                    ))));
                false
            } else {
                true
            }
        });
    }

    /// Closes every open feed without an error.
    pub fn drop_feeds(&self) {
        self.lock().feeds.clear();
    }

    /// Number of live feeds.
    pub fn feed_count(&self) -> usize {
        let mut state = self.lock();
        state.feeds.retain(|feed| !feed.tx.is_closed());
        state.feeds.len()
    }

    /// Writes a record as another device would (full replace, pushed to feeds).
    pub fn server_put(
        &self,
        account: &AccountId,
        collection: Collection,
        id: &EntityId,
        payload: Payload,
    ) -> RemoteRecord {
        let mut state = self.lock();
        let kind = if state.lookup(account, collection, id).is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let clock = self.clock.clone();
        match state.store(clock.as_ref(), account, collection, id.clone(), payload, kind) {
            WriteOutcome::Written(record) => record,
            WriteOutcome::Deleted { id, at } => RemoteRecord {
                id,
                payload: Payload::new(),
                last_modified: at,
            },
        }
    }

    /// Deletes a record as another device would.
    pub fn server_delete(&self, account: &AccountId, collection: Collection, id: &EntityId) {
        let mut state = self.lock();
        let clock = self.clock.clone();
        state.remove(clock.as_ref(), account, collection, id);
    }

    /// Current server copy of a record.
    pub fn record(
        &self,
        account: &AccountId,
        collection: Collection,
        id: &EntityId,
    ) -> Option<RemoteRecord> {
        self.lock().lookup(account, collection, id).cloned()
    }

    /// Every record in a collection, ordered by id.
    pub fn records(&self, account: &AccountId, collection: Collection) -> Vec<RemoteRecord> {
        self.lock()
            .records
            .get(&(account.clone(), collection))
            .map(|m| m.values().map(|(r, _)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Every client write received so far, in arrival order.
    pub fn write_log(&self) -> Vec<WriteLogEntry> {
        self.lock().writes.clone()
    }

    /// Number of committed batches.
    pub fn batch_count(&self) -> u64 {
        self.lock().batches
    }
}

impl State {
    fn stamp(&mut self, clock: &dyn Clock) -> Timestamp {
        let next = clock.now().as_millis().max(self.last_stamp + 1);
        self.last_stamp = next;
        Timestamp::from_millis(next)
    }

    fn check_access(&self, account: &AccountId, collection: Collection) -> RemoteResult<()> {
        if self.unreachable {
            return Err(RemoteError::Unavailable("remote store unreachable".into()));
        }
        if self.revoked.contains(&(account.clone(), collection)) {
            return Err(RemoteError::PermissionDenied(format!(
                "access to {collection} revoked"
            )));
        }
        Ok(())
    }

    fn take_injected(&mut self) -> RemoteResult<()> {
        match self.injected.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn lookup(
        &self,
        account: &AccountId,
        collection: Collection,
        id: &EntityId,
    ) -> Option<&RemoteRecord> {
        self.records
            .get(&(account.clone(), collection))
            .and_then(|m| m.get(id))
            .map(|(r, _)| r)
    }

    fn apply(&mut self, clock: &dyn Clock, account: &AccountId, write: RemoteWrite) -> WriteOutcome {
        match write {
            RemoteWrite::Create {
                collection,
                payload,
            } => {
                self.next_id += 1;
                let id = EntityId::new(format!("rec-{}", self.next_id));
                self.store(clock, account, collection, id, payload, ChangeKind::Added)
            }
            RemoteWrite::Update {
                collection,
                id,
                patch,
            } => {
                let (payload, kind) = match self.lookup(account, collection, &id) {
                    Some(existing) => (merged(&existing.payload, &patch), ChangeKind::Modified),
                    None => (patch, ChangeKind::Added),
                };
                self.store(clock, account, collection, id, payload, kind)
            }
            RemoteWrite::Replace {
                collection,
                id,
                payload,
            } => {
                let kind = if self.lookup(account, collection, &id).is_some() {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Added
                };
                self.store(clock, account, collection, id, payload, kind)
            }
            RemoteWrite::Delete { collection, id } => self.remove(clock, account, collection, &id),
        }
    }

    fn store(
        &mut self,
        clock: &dyn Clock,
        account: &AccountId,
        collection: Collection,
        id: EntityId,
        payload: Payload,
        kind: ChangeKind,
    ) -> WriteOutcome {
        let at = self.stamp(clock);
        self.sequence += 1;
        let sequence = self.sequence;
        let record = RemoteRecord {
            id: id.clone(),
            payload: payload.clone(),
            last_modified: at,
        };
        self.records
            .entry((account.clone(), collection))
            .or_default()
            .insert(id.clone(), (record.clone(), sequence));
        self.publish(
            account,
            collection,
            RemoteChange {
                kind,
                id,
                payload,
                last_modified: at,
                sequence,
            },
        );
        WriteOutcome::Written(record)
    }

    fn remove(
        &mut self,
        clock: &dyn Clock,
        account: &AccountId,
        collection: Collection,
        id: &EntityId,
    ) -> WriteOutcome {
        let at = self.stamp(clock);
        let existed = self
            .records
            .get_mut(&(account.clone(), collection))
            .and_then(|m| m.remove(id))
            .is_some();
        if existed {
            self.sequence += 1;
            let sequence = self.sequence;
            self.publish(
                account,
                collection,
                RemoteChange {
                    kind: ChangeKind::Removed,
                    id: id.clone(),
                    payload: Payload::new(),
                    last_modified: at,
                    sequence,
                },
            );
        }
        WriteOutcome::Deleted { id: id.clone(), at }
    }

    fn publish(&mut self, account: &AccountId, collection: Collection, change: RemoteChange) {
        self.changes.push(LoggedChange {
            account: account.clone(),
            collection,
            change: change.clone(),
        });
        self.feeds.retain(|feed| {
            if feed.query.account != *account
                || feed.query.collection != collection
                || !visible(&feed.query, &change)
            {
                return !feed.tx.is_closed();
            }
            // A full buffer drops the feed; the consumer resumes from its
            // last sequence when it resubscribes.
            feed.tx.try_send(Ok(change.clone())).is_ok()
        });
    }
}

fn visible(query: &Query, change: &RemoteChange) -> bool {
    change.kind == ChangeKind::Removed || query.filter.matches(&change.payload)
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn subscribe(&self, query: &Query, resume_after: Option<u64>) -> RemoteResult<ChangeFeed> {
        let mut state = self.lock();
        state.check_access(&query.account, query.collection)?;

        let backlog: Vec<RemoteChange> = match resume_after {
            Some(after) => state
                .changes
                .iter()
                .filter(|c| {
                    c.account == query.account
                        && c.collection == query.collection
                        && c.change.sequence > after
                })
                .map(|c| c.change.clone())
                .filter(|c| visible(query, c))
                .collect(),
            None => state
                .records
                .get(&(query.account.clone(), query.collection))
                .map(|m| {
                    m.values()
                        .map(|(record, sequence)| RemoteChange {
                            kind: ChangeKind::Added,
                            id: record.id.clone(),
                            payload: record.payload.clone(),
                            last_modified: record.last_modified,
                            sequence: *sequence,
                        })
                        .filter(|c| visible(query, c))
                        .collect()
                })
                .unwrap_or_default(),
        };

        let (tx, rx) = mpsc::channel(FEED_CAPACITY + backlog.len());
        debug!(
            "Opening feed for {}/{} with {} backlog changes",
            query.account,
            query.collection,
            backlog.len()
        );
        for change in backlog {
            let _ = tx.try_send(Ok(change));
        }
        state.feeds.push(Feed {
            query: query.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn get(
        &self,
        account: &AccountId,
        collection: Collection,
        id: &EntityId,
    ) -> RemoteResult<Option<RemoteRecord>> {
        let state = self.lock();
        state.check_access(account, collection)?;
        Ok(state.lookup(account, collection, id).cloned())
    }

    async fn write(&self, account: &AccountId, write: RemoteWrite) -> RemoteResult<WriteOutcome> {
        let mut state = self.lock();
        state.check_access(account, write.collection())?;
        state.take_injected()?;
        state.writes.push(WriteLogEntry {
            account: account.clone(),
            batch: None,
            write: write.clone(),
        });
        Ok(state.apply(self.clock.as_ref(), account, write))
    }

    async fn commit_batch(
        &self,
        account: &AccountId,
        writes: Vec<RemoteWrite>,
    ) -> RemoteResult<Vec<WriteOutcome>> {
        let mut state = self.lock();
        for write in &writes {
            state.check_access(account, write.collection())?;
        }
        state.take_injected()?;
        state.batches += 1;
        let batch = state.batches;
        let mut outcomes = Vec::with_capacity(writes.len());
        for write in writes {
            state.writes.push(WriteLogEntry {
                account: account.clone(),
                batch: Some(batch),
                write: write.clone(),
            });
            outcomes.push(state.apply(self.clock.as_ref(), account, write));
        }
        debug!("Committed batch {} with {} writes", batch, outcomes.len());
        Ok(outcomes)
    }
}
