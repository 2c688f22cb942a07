//! Optimistic mutation coordinator.
//!
//! Every local write lands in the cache first (unsynced) and is then sent to
//! the remote store in the background. Mutations are queued per target entity:
//! the head of a target's queue is in flight, the rest wait their turn, so
//! writes to one entity reach the server in the order they were made.
//!
//! While offline, mutations are parked in the account's outbox instead of
//! being sent. When connectivity returns the outbox is committed in original
//! order as one atomic batch. The batch is cut short only where a mutation
//! needs an id the server has not assigned yet (an update to an entity created
//! earlier in the same batch); the remainder follows in the next batch.
//!
//! Server events for an entity with a pending mutation are held back and
//! applied once the entity's queue drains, so an optimistic write is never
//! overwritten by an older server copy racing the confirmation. While a create
//! is in flight, server copies of entities the cache does not know yet are
//! held as well: one of them may be the record the create produced, pushed
//! before the write was acknowledged.

use crate::config::{ConflictPolicy, MutationConfig};
use crate::error::{SyncError, SyncResult};
use crate::mutation::{
    CoordinatorEvent, CreateHandle, FailedMutation, Job, MutationHandle, MutationKind,
    MutationOutcome, MutationReceipt, MutationState, PendingMutation, Request, Submitted,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tandem_cache::{CacheStore, PutOutcome};
use tandem_remote::{RemoteRecord, RemoteStore, RemoteWrite, WriteOutcome};
use tandem_types::{
    AccountId, CacheEntry, ChangeKind, Clock, Collection, Entity, EntityId, EventOrigin,
    OperationId, Payload, SyncEvent, Timestamp, merge_patch, merged,
};
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

type Target = (Collection, EntityId);

/// How the server ended up treating a mutation.
#[derive(Debug, Clone)]
enum Resolution {
    Written(RemoteRecord),
    Deleted(Timestamp),
    /// Server-wins conflict: the server copy was kept.
    Kept(RemoteRecord),
}

impl From<WriteOutcome> for Resolution {
    fn from(outcome: WriteOutcome) -> Self {
        match outcome {
            WriteOutcome::Written(record) => Resolution::Written(record),
            WriteOutcome::Deleted { at, .. } => Resolution::Deleted(at),
        }
    }
}

#[derive(Debug, Clone)]
struct Resolved {
    resolution: Resolution,
    conflict: Option<ConflictPolicy>,
}

enum Plan {
    Write {
        write: RemoteWrite,
        conflict: Option<ConflictPolicy>,
    },
    Keep(RemoteRecord),
    Reject(SyncError),
}

enum Execution {
    Done(SyncResult<Resolved>),
    /// Connectivity dropped; the mutation belongs in the outbox.
    Parked,
}

/// What is still queued behind a resolving mutation.
#[derive(Default)]
struct Behind {
    /// Patches of queued updates, merged in order.
    overlay: Payload,
    deletes: bool,
}

#[derive(Default)]
struct CoordinatorState {
    next_seq: u64,
    queues: HashMap<Target, VecDeque<PendingMutation>>,
    /// Targets with a worker driving their queue.
    running: HashSet<Target>,
    /// Parked mutations by sequence number.
    outbox: BTreeMap<u64, Target>,
    /// Temporary id to real id and when the create resolved.
    aliases: HashMap<EntityId, (EntityId, Timestamp)>,
    deferred: HashMap<Target, Vec<SyncEvent>>,
    /// Server events for uncached entities, held while creates are in flight.
    held: HashMap<Collection, Vec<SyncEvent>>,
    failed: HashMap<OperationId, FailedMutation>,
    closed: bool,
}

impl CoordinatorState {
    fn resolve(&self, id: &EntityId) -> EntityId {
        let mut current = id;
        while let Some((next, _)) = self.aliases.get(current) {
            current = next;
        }
        current.clone()
    }

    fn is_pending(&self, target: &Target) -> bool {
        self.queues.get(target).is_some_and(|q| !q.is_empty())
    }

    fn pending_count(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Whether a create in `collection` has reached the remote store and not
    /// resolved yet.
    fn create_in_flight(&self, collection: Collection) -> bool {
        self.queues.iter().any(|((c, _), queue)| {
            *c == collection
                && queue
                    .iter()
                    .any(|op| op.kind == MutationKind::Create && op.sent)
        })
    }

    /// Hands back held server events of `collection`: those for `id` right
    /// away, all of them once no create is in flight.
    fn unhold(&mut self, collection: Collection, id: Option<&EntityId>) -> Vec<SyncEvent> {
        let settled = !self.create_in_flight(collection);
        let Some(held) = self.held.remove(&collection) else {
            return Vec::new();
        };
        let (out, keep): (Vec<_>, Vec<_>) = held
            .into_iter()
            .partition(|e| settled || Some(&e.entity_id) == id);
        if !keep.is_empty() {
            self.held.insert(collection, keep);
        }
        out
    }

    /// Removes the failed mutations of `target`, oldest first.
    fn take_failed(&mut self, target: &Target) -> Vec<FailedMutation> {
        let ids: Vec<OperationId> = self
            .failed
            .iter()
            .filter(|(_, f)| f.collection == target.0 && f.target == target.1)
            .map(|(id, _)| *id)
            .collect();
        let mut taken: Vec<FailedMutation> =
            ids.iter().filter_map(|id| self.failed.remove(id)).collect();
        taken.sort_by_key(|f| f.seq);
        taken
    }

    fn prune_aliases(&mut self, now: Timestamp, ttl: Duration) {
        let before = self.aliases.len();
        self.aliases.retain(|_, (_, at)| now.since(*at) <= ttl);
        let pruned = before - self.aliases.len();
        if pruned > 0 {
            debug!("Forgot {} expired temporary id(s)", pruned);
        }
    }

    /// Parks every queued mutation of `target` not already parked.
    fn park(&mut self, target: &Target) -> usize {
        let Some(queue) = self.queues.get_mut(target) else {
            return 0;
        };
        let mut parked = 0;
        for op in queue.iter_mut().filter(|op| !op.parked) {
            op.parked = true;
            self.outbox.insert(op.seq, target.clone());
            parked += 1;
        }
        parked
    }

    fn take(&mut self, target: &Target, seq: u64) -> Option<PendingMutation> {
        self.outbox.remove(&seq);
        let queue = self.queues.get_mut(target)?;
        let pos = queue.iter().position(|op| op.seq == seq)?;
        queue.remove(pos)
    }

    /// Moves everything keyed by a temporary id over to the real id.
    fn rekey(&mut self, from: &Target, to: &Target) {
        if let Some(mut queue) = self.queues.remove(from) {
            for op in queue.iter_mut() {
                op.target = to.1.clone();
                if self.outbox.contains_key(&op.seq) {
                    self.outbox.insert(op.seq, to.clone());
                }
            }
            self.queues.entry(to.clone()).or_default().extend(queue);
        }
        if self.running.remove(from) {
            self.running.insert(to.clone());
        }
        if let Some(events) = self.deferred.remove(from) {
            self.deferred.entry(to.clone()).or_default().extend(events);
        }
    }

    /// Drops an empty queue and hands back the events deferred behind it.
    fn release(&mut self, target: &Target) -> Vec<SyncEvent> {
        if self.is_pending(target) {
            return Vec::new();
        }
        self.queues.remove(target);
        self.deferred.remove(target).unwrap_or_default()
    }

    fn behind(&self, target: &Target, seq: u64) -> Behind {
        let mut behind = Behind::default();
        for op in self
            .queues
            .get(target)
            .into_iter()
            .flatten()
            .filter(|op| op.seq != seq)
        {
            match op.kind {
                MutationKind::Update => merge_patch(&mut behind.overlay, &op.payload),
                MutationKind::Delete => behind.deletes = true,
                MutationKind::Create => {}
            }
        }
        behind
    }
}

/// Applies local writes optimistically and reconciles them with the remote
/// store. One coordinator serves one account.
///
/// Dropping the coordinator stops its tasks; unresolved handles then fail with
/// [`SyncError::ChannelClosed`].
pub struct MutationCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    account: AccountId,
    remote: Arc<dyn RemoteStore>,
    cache: CacheStore,
    config: MutationConfig,
    clock: Arc<dyn Clock>,
    online: watch::Receiver<bool>,
    state: Mutex<CoordinatorState>,
    /// Serializes optimistic writes, resolutions and server-event intake so
    /// the cache and the queues change together.
    gate: AsyncMutex<()>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    outbox_ready: Notify,
    tasks: Mutex<JoinSet<()>>,
}

impl MutationCoordinator {
    /// Starts a coordinator and its outbox task. Must be called from within a
    /// Tokio runtime.
    pub fn start(
        account: AccountId,
        remote: Arc<dyn RemoteStore>,
        cache: CacheStore,
        config: MutationConfig,
        clock: Arc<dyn Clock>,
        online: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<CoordinatorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            account,
            remote,
            cache,
            config,
            clock,
            online,
            state: Mutex::new(CoordinatorState::default()),
            gate: AsyncMutex::new(()),
            events,
            outbox_ready: Notify::new(),
            tasks: Mutex::new(JoinSet::new()),
        });
        let flusher = inner.clone();
        inner.spawn(flusher.run_outbox());
        (Self { inner }, rx)
    }

    pub fn account(&self) -> &AccountId {
        &self.inner.account
    }

    /// Creates an entity under a temporary id. The handle resolves with the
    /// id assigned by the server.
    pub async fn create(
        &self,
        collection: Collection,
        payload: Payload,
    ) -> SyncResult<Submitted<CreateHandle>> {
        let inner = &self.inner;
        let _gate = inner.gate.lock().await;
        inner.ensure_open()?;

        let temp_id = EntityId::temporary();
        let written = inner
            .cache
            .apply_patch(collection, &inner.account, &temp_id, payload.clone())
            .await?;
        let (handle, reply) = MutationHandle::new(OperationId::new());
        inner.enqueue(
            Request::new(MutationKind::Create, collection, temp_id.clone(), payload, None),
            handle.operation_id(),
            reply,
        );
        debug!("Queued create {} as {}/{}", handle.operation_id(), collection, temp_id);

        Ok(Submitted {
            event: SyncEvent::from_entry(&written.after, ChangeKind::Added, EventOrigin::Local),
            handle: CreateHandle { temp_id, handle },
        })
    }

    /// Shallow-merges `patch` into an entity.
    ///
    /// `snapshot` is the view the caller based the change on. Without one,
    /// the cached copy at the time of the call is used.
    pub async fn update(
        &self,
        collection: Collection,
        id: &EntityId,
        patch: Payload,
        snapshot: Option<CacheEntry>,
    ) -> SyncResult<Submitted<MutationHandle>> {
        let inner = &self.inner;
        let _gate = inner.gate.lock().await;
        inner.ensure_open()?;

        let target = inner.lock_state().resolve(id);
        let written = inner
            .cache
            .apply_patch(collection, &inner.account, &target, patch.clone())
            .await?;
        let kind = if written.before.is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let snapshot = snapshot.or(written.before);
        let (handle, reply) = MutationHandle::new(OperationId::new());
        inner.enqueue(
            Request::new(MutationKind::Update, collection, target.clone(), patch, snapshot),
            handle.operation_id(),
            reply,
        );
        debug!("Queued update {} for {}/{}", handle.operation_id(), collection, target);

        Ok(Submitted {
            event: SyncEvent::from_entry(&written.after, kind, EventOrigin::Local),
            handle,
        })
    }

    /// Deletes an entity.
    pub async fn delete(
        &self,
        collection: Collection,
        id: &EntityId,
        snapshot: Option<CacheEntry>,
    ) -> SyncResult<Submitted<MutationHandle>> {
        let inner = &self.inner;
        let _gate = inner.gate.lock().await;
        inner.ensure_open()?;

        let target = inner.lock_state().resolve(id);
        let before = inner.cache.remove(collection, &inner.account, &target).await?;
        let snapshot = snapshot.or(before);
        let (handle, reply) = MutationHandle::new(OperationId::new());
        inner.enqueue(
            Request::new(
                MutationKind::Delete,
                collection,
                target.clone(),
                Payload::new(),
                snapshot,
            ),
            handle.operation_id(),
            reply,
        );
        debug!("Queued delete {} for {}/{}", handle.operation_id(), collection, target);

        Ok(Submitted {
            event: SyncEvent::removed(collection, target, inner.clock.now(), EventOrigin::Local),
            handle,
        })
    }

    /// Undoes the optimistic write of a failed mutation and returns the local
    /// event describing the restored state.
    pub async fn rollback(&self, operation_id: OperationId) -> SyncResult<SyncEvent> {
        let inner = &self.inner;
        let _gate = inner.gate.lock().await;
        let failed = inner
            .lock_state()
            .failed
            .remove(&operation_id)
            .ok_or(SyncError::UnknownOperation(operation_id))?;

        let FailedMutation {
            kind,
            collection,
            target,
            snapshot,
            ..
        } = failed;
        let event = match (kind, snapshot) {
            (MutationKind::Create, _) | (_, None) => {
                inner.cache.delete(collection, &inner.account, &target).await?;
                SyncEvent::removed(collection, target.clone(), inner.clock.now(), EventOrigin::Local)
            }
            (kind, Some(snapshot)) => {
                inner.cache.restore(snapshot.clone()).await?;
                let change = if kind == MutationKind::Delete {
                    ChangeKind::Added
                } else {
                    ChangeKind::Modified
                };
                SyncEvent::from_entry(&snapshot, change, EventOrigin::Local)
            }
        };
        info!("Rolled back {:?} {} on {}/{}", kind, operation_id, collection, target);

        inner.emit(CoordinatorEvent::Resolved(MutationOutcome {
            operation_id,
            kind,
            state: MutationState::RolledBack,
            collection,
            entity_id: target,
            previous_id: None,
            entry: None,
            events: Vec::new(),
            error: None,
        }));
        Ok(event)
    }

    /// Sends an unsynced cache entry again. Returns `None` if a mutation for
    /// the entity is already pending.
    ///
    /// Temporary ids are re-created with the cached payload. For a real id,
    /// the patches of its failed updates are replayed as one update against
    /// the server view they were based on, so the conflict policy applies as
    /// it did the first time. An entry with no failed update on record (left
    /// over from an earlier session) is sent whole, and any server copy
    /// modified after the local write counts as a conflict.
    pub async fn resubmit(&self, entry: CacheEntry) -> SyncResult<Option<MutationHandle>> {
        let inner = &self.inner;
        let _gate = inner.gate.lock().await;
        inner.ensure_open()?;

        let key = (entry.collection, entry.entity_id.clone());
        let failed = {
            let mut state = inner.lock_state();
            if state.is_pending(&key) {
                return Ok(None);
            }
            if entry.entity_id.is_temporary() && state.aliases.contains_key(&entry.entity_id) {
                return Ok(None);
            }
            state.take_failed(&key)
        };

        let request = if entry.entity_id.is_temporary() {
            Request::new(
                MutationKind::Create,
                entry.collection,
                entry.entity_id.clone(),
                entry.payload,
                None,
            )
        } else {
            replay(entry, failed)
        };
        let kind = request.kind;
        let (collection, target) = (request.collection, request.target.clone());
        let (handle, reply) = MutationHandle::new(OperationId::new());
        inner.enqueue(request, handle.operation_id(), reply);
        debug!("Resubmitted {}/{} as {:?}", collection, target, kind);
        Ok(Some(handle))
    }

    /// Routes a server event: applied to the cache now, or held back while
    /// the entity has a pending mutation or may be the result of a create in
    /// flight. Returns the event if it changed the cache and should be
    /// published.
    pub async fn absorb(&self, event: SyncEvent) -> SyncResult<Option<SyncEvent>> {
        let inner = &self.inner;
        let _gate = inner.gate.lock().await;
        let creating = {
            let mut state = inner.lock_state();
            let key = (event.collection, event.entity_id.clone());
            if state.is_pending(&key) {
                debug!(
                    "Deferring server {:?} for {}/{} behind pending mutation",
                    event.kind, key.0, key.1
                );
                state.deferred.entry(key).or_default().push(event);
                return Ok(None);
            }
            !event.is_removal() && state.create_in_flight(event.collection)
        };

        if creating
            && inner
                .cache
                .get(event.collection, &inner.account, &event.entity_id)
                .await?
                .is_none()
        {
            debug!(
                "Holding server {:?} for {}/{} until creates in flight resolve",
                event.kind, event.collection, event.entity_id
            );
            inner
                .lock_state()
                .held
                .entry(event.collection)
                .or_default()
                .push(event);
            return Ok(None);
        }
        inner.apply_server(event).await
    }

    /// Mutations not yet confirmed or failed.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_state().pending_count()
    }

    /// Mutations waiting in the offline outbox.
    pub fn parked_count(&self) -> usize {
        self.inner.lock_state().outbox.len()
    }

    /// The current id of an entity that may have been created under a
    /// temporary id.
    pub fn resolve_id(&self, id: &EntityId) -> EntityId {
        self.inner.lock_state().resolve(id)
    }

    /// Failed mutations awaiting rollback.
    pub fn failed_operations(&self) -> Vec<OperationId> {
        self.inner.lock_state().failed.keys().copied().collect()
    }

    /// Stops all background work. Pending handles fail.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for MutationCoordinator {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.lock_state().closed {
            return Err(SyncError::ChannelClosed);
        }
        Ok(())
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(fut);
    }

    fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queues.clear();
            state.running.clear();
            state.outbox.clear();
            state.deferred.clear();
            state.held.clear();
        }
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        debug!("Mutation coordinator for {} stopped", self.account);
    }

    fn enqueue(
        self: &Arc<Self>,
        request: Request,
        id: OperationId,
        reply: tokio::sync::oneshot::Sender<SyncResult<MutationReceipt>>,
    ) {
        let parked = !self.is_online();
        let kind = request.kind;
        let key = (request.collection, request.target.clone());
        {
            let mut state = self.lock_state();
            state.next_seq += 1;
            let seq = state.next_seq;
            if parked {
                state.outbox.insert(seq, key.clone());
            }
            state.queues.entry(key.clone()).or_default().push_back(PendingMutation {
                seq,
                id,
                kind,
                collection: request.collection,
                target: request.target,
                payload: request.payload,
                snapshot: request.snapshot,
                base: request.base,
                parked,
                sent: false,
                reply: Some(reply),
            });
        }
        if parked {
            debug!("Offline, parked {:?} {} in outbox", kind, id);
            self.outbox_ready.notify_one();
        } else {
            self.kick(&key);
        }
    }

    /// Starts a worker for `target` if its head is ready and none is running.
    fn kick(self: &Arc<Self>, target: &Target) {
        {
            let mut state = self.lock_state();
            if state.closed || state.running.contains(target) {
                return;
            }
            let ready = state
                .queues
                .get(target)
                .and_then(VecDeque::front)
                .is_some_and(|op| !op.parked);
            if !ready {
                return;
            }
            state.running.insert(target.clone());
        }
        let inner = self.clone();
        let target = target.clone();
        self.spawn(async move { inner.drive(target).await });
    }

    // ── Online path ──────────────────────────────────────────────

    /// Sends the queue of one target, head first, until it is empty, parked
    /// or handed over to the outbox.
    async fn drive(self: Arc<Self>, mut target: Target) {
        loop {
            let job = {
                let mut guard = self.lock_state();
                let state = &mut *guard;
                match state.queues.get_mut(&target).and_then(VecDeque::front_mut) {
                    Some(op) if !op.parked => {
                        op.sent = true;
                        Some(op.job())
                    }
                    _ => {
                        state.running.remove(&target);
                        None
                    }
                }
            };
            let Some(job) = job else {
                self.outbox_ready.notify_one();
                return;
            };

            match self.execute(&job).await {
                Execution::Done(result) => {
                    target = self.finish(&target, job, result).await;
                }
                Execution::Parked => {
                    let parked = {
                        let mut state = self.lock_state();
                        state.running.remove(&target);
                        state.park(&target)
                    };
                    info!(
                        "Connectivity lost, parked {} mutation(s) for {}/{}",
                        parked, target.0, target.1
                    );
                    self.outbox_ready.notify_one();
                    return;
                }
            }
        }
    }

    async fn execute(&self, job: &Job) -> Execution {
        let mut attempt: u32 = 0;
        loop {
            if !self.is_online() {
                return Execution::Parked;
            }
            match self.attempt(job).await {
                Ok(resolved) => return Execution::Done(Ok(resolved)),
                Err(err) if err.is_transient() => {
                    if !self.is_online() {
                        return Execution::Parked;
                    }
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(
                            "{:?} {} gave up after {} attempts: {}",
                            job.kind, job.id, attempt, err
                        );
                        return Execution::Done(Err(err));
                    }
                    let delay = self
                        .config
                        .retry
                        .delay_at_least(attempt, err.retry_after());
                    debug!(
                        "{:?} {} failed ({}), retry {} in {:?}",
                        job.kind, job.id, err, attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Execution::Done(Err(err)),
            }
        }
    }

    async fn attempt(&self, job: &Job) -> SyncResult<Resolved> {
        match self.plan(job).await? {
            Plan::Write { write, conflict } => {
                let outcome = self.remote.write(&self.account, write).await?;
                Ok(Resolved {
                    resolution: outcome.into(),
                    conflict,
                })
            }
            Plan::Keep(record) => Ok(Resolved {
                resolution: Resolution::Kept(record),
                conflict: Some(ConflictPolicy::ServerWins),
            }),
            Plan::Reject(err) => Err(err),
        }
    }

    /// Decides what to send for `job`, checking for a conflicting server copy
    /// first when the job carries a confirmed snapshot.
    async fn plan(&self, job: &Job) -> SyncResult<Plan> {
        if job.kind == MutationKind::Create {
            return Ok(Plan::Write {
                write: RemoteWrite::Create {
                    collection: job.collection,
                    payload: job.payload.clone(),
                },
                conflict: None,
            });
        }

        let Some(server) = self.conflicting_record(job).await? else {
            return Ok(Plan::Write {
                write: plain_write(job),
                conflict: None,
            });
        };

        let policy = self.config.conflict_policy;
        info!(
            "Conflict on {}/{} (server modified at {}), resolving with {:?}",
            job.collection, job.target, server.last_modified, policy
        );
        Ok(match (job.kind, policy) {
            (_, ConflictPolicy::Fail) => Plan::Reject(SyncError::Conflict {
                collection: job.collection,
                entity_id: job.target.clone(),
                server_modified: server.last_modified,
            }),
            (_, ConflictPolicy::ServerWins) => Plan::Keep(server),
            (MutationKind::Update, ConflictPolicy::ClientWins) => Plan::Write {
                write: RemoteWrite::Replace {
                    collection: job.collection,
                    id: job.target.clone(),
                    payload: client_view(job),
                },
                conflict: Some(policy),
            },
            _ => Plan::Write {
                write: plain_write(job),
                conflict: Some(policy),
            },
        })
    }

    async fn conflicting_record(&self, job: &Job) -> SyncResult<Option<RemoteRecord>> {
        let Some(base) = job.base else {
            return Ok(None);
        };
        let record = self
            .remote
            .get(&self.account, job.collection, &job.target)
            .await?;
        Ok(record.filter(|r| r.last_modified > base))
    }

    // ── Outbox ───────────────────────────────────────────────────

    async fn run_outbox(self: Arc<Self>) {
        let mut online = self.online.clone();
        loop {
            while self.is_online() {
                let Some(batch) = self.take_batch() else {
                    break;
                };
                self.flush(batch).await;
            }
            tokio::select! {
                _ = self.outbox_ready.notified() => {}
                changed = online.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Takes the longest prefix of the outbox that can be committed together.
    fn take_batch(&self) -> Option<Vec<Job>> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let mut batch: Vec<Job> = Vec::new();
        let mut included: HashSet<u64> = HashSet::new();
        let mut stale: Vec<u64> = Vec::new();

        for (&seq, target) in &state.outbox {
            let Some(queue) = state.queues.get(target) else {
                stale.push(seq);
                continue;
            };
            let Some(pos) = queue.iter().position(|op| op.seq == seq) else {
                stale.push(seq);
                continue;
            };
            let op = &queue[pos];
            let after_included = queue.iter().take(pos).all(|o| included.contains(&o.seq));
            let addressable = op.kind == MutationKind::Create || !op.target.is_temporary();
            if !after_included || !addressable || state.running.contains(target) {
                break;
            }
            included.insert(seq);
            batch.push(op.job());
        }

        for seq in stale {
            state.outbox.remove(&seq);
        }
        if batch.is_empty() {
            return None;
        }
        for job in &batch {
            state.outbox.remove(&job.seq);
            let op = state
                .queues
                .get_mut(&(job.collection, job.target.clone()))
                .and_then(|queue| queue.iter_mut().find(|op| op.seq == job.seq));
            if let Some(op) = op {
                op.sent = true;
            }
        }
        Some(batch)
    }

    fn repark(&self, batch: &[Job]) {
        let mut state = self.lock_state();
        for job in batch {
            state
                .outbox
                .insert(job.seq, (job.collection, job.target.clone()));
        }
    }

    async fn flush(self: &Arc<Self>, batch: Vec<Job>) {
        info!("Flushing {} parked mutation(s)", batch.len());
        let mut attempt: u32 = 0;
        let result = loop {
            if !self.is_online() {
                self.repark(&batch);
                info!("Connectivity lost during flush, {} mutation(s) re-parked", batch.len());
                return;
            }
            match self.attempt_batch(&batch).await {
                Ok(results) => break Ok(results),
                Err(err) if err.is_transient() => {
                    if !self.is_online() {
                        continue;
                    }
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!("Outbox flush gave up after {} attempts: {}", attempt, err);
                        break Err(err);
                    }
                    let delay = self
                        .config
                        .retry
                        .delay_at_least(attempt, err.retry_after());
                    debug!("Outbox flush failed ({}), retry {} in {:?}", err, attempt, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!("Outbox flush rejected: {}", err);
                    break Err(err);
                }
            }
        };

        let total = batch.len();
        let mut failed = 0;
        let mut touched = Vec::with_capacity(total);
        match result {
            Ok(results) => {
                for (job, result) in batch.into_iter().zip(results) {
                    if result.is_err() {
                        failed += 1;
                    }
                    let target = (job.collection, job.target.clone());
                    touched.push(self.finish(&target, job, result).await);
                }
            }
            Err(err) => {
                for job in batch {
                    failed += 1;
                    let target = (job.collection, job.target.clone());
                    touched.push(self.finish(&target, job, Err(err.clone())).await);
                }
            }
        }
        for target in &touched {
            self.kick(target);
        }
        info!("Outbox flush done: {} committed, {} failed", total - failed, failed);
        self.emit(CoordinatorEvent::OutboxFlushed {
            committed: total - failed,
            failed,
        });
    }

    /// One attempt at the whole batch. Conflict checks run first; the writes
    /// that remain are committed atomically.
    async fn attempt_batch(&self, batch: &[Job]) -> SyncResult<Vec<SyncResult<Resolved>>> {
        let mut plans = Vec::with_capacity(batch.len());
        for job in batch {
            plans.push(self.plan(job).await?);
        }

        let writes: Vec<RemoteWrite> = plans
            .iter()
            .filter_map(|plan| match plan {
                Plan::Write { write, .. } => Some(write.clone()),
                _ => None,
            })
            .collect();
        let outcomes = if writes.is_empty() {
            Vec::new()
        } else {
            self.remote.commit_batch(&self.account, writes).await?
        };

        let mut outcomes = outcomes.into_iter();
        Ok(plans
            .into_iter()
            .map(|plan| match plan {
                Plan::Write { conflict, .. } => match outcomes.next() {
                    Some(outcome) => Ok(Resolved {
                        resolution: outcome.into(),
                        conflict,
                    }),
                    None => Err(SyncError::RemoteRejection(
                        "batch returned fewer results than writes".into(),
                    )),
                },
                Plan::Keep(record) => Ok(Resolved {
                    resolution: Resolution::Kept(record),
                    conflict: Some(ConflictPolicy::ServerWins),
                }),
                Plan::Reject(err) => Err(err),
            })
            .collect())
    }

    // ── Resolution ───────────────────────────────────────────────

    /// Records the result of `job`, which must still be queued under
    /// `target`. Returns the key the target's queue lives under afterwards.
    async fn finish(&self, target: &Target, job: Job, result: SyncResult<Resolved>) -> Target {
        let _gate = self.gate.lock().await;
        match result {
            Ok(resolved) => self.confirm(target, job, resolved).await,
            Err(err) => self.fail(target, job, err).await,
        }
    }

    async fn confirm(&self, target: &Target, job: Job, resolved: Resolved) -> Target {
        let behind = self.lock_state().behind(target, job.seq);
        let entry = match self.settle_cache(&job, &resolved.resolution, &behind).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    "Cache update after {:?} {} failed: {}",
                    job.kind, job.id, err
                );
                None
            }
        };

        let (entity_id, payload, last_modified) = match &resolved.resolution {
            Resolution::Written(record) | Resolution::Kept(record) => {
                (record.id.clone(), record.payload.clone(), record.last_modified)
            }
            Resolution::Deleted(at) => (job.target.clone(), Payload::new(), *at),
        };
        let server_view = match &resolved.resolution {
            Resolution::Written(record) | Resolution::Kept(record) => Some(CacheEntry::synced(
                Entity::new(
                    record.id.clone(),
                    self.account.clone(),
                    job.collection,
                    record.payload.clone(),
                ),
                record.last_modified,
                self.clock.now(),
            )),
            Resolution::Deleted(_) => None,
        };
        let previous_id = (job.kind == MutationKind::Create).then(|| job.target.clone());

        let (reply, next, released, unheld) = {
            let mut state = self.lock_state();
            let head = state.take(target, job.seq);
            let mut next = target.clone();
            let mut unheld = Vec::new();
            if let Some(temp) = &previous_id {
                let now = self.clock.now();
                state.prune_aliases(now, self.config.alias_ttl());
                state.aliases.insert(temp.clone(), (entity_id.clone(), now));
                next = (job.collection, entity_id.clone());
                state.rekey(target, &next);
                unheld = state.unhold(job.collection, Some(&entity_id));
            }
            if let Some(view) = &server_view {
                // Later mutations based on our own unconfirmed write are now
                // based on what the server confirmed.
                for op in state.queues.get_mut(&next).into_iter().flatten() {
                    if op.snapshot.as_ref().is_some_and(|s| !s.synced) {
                        op.snapshot = Some(view.clone());
                        op.base = Some(view.last_modified);
                    }
                }
            }
            let released = state.release(&next);
            (head.and_then(|op| op.reply), next, released, unheld)
        };

        let mut events = Vec::new();
        if let Some(entry) = &entry {
            if let Some(temp) = &previous_id {
                events.push(SyncEvent::removed(
                    job.collection,
                    temp.clone(),
                    entry.last_modified,
                    EventOrigin::Local,
                ));
            }
            let change = match job.kind {
                MutationKind::Create | MutationKind::Delete => ChangeKind::Added,
                MutationKind::Update => ChangeKind::Modified,
            };
            events.push(SyncEvent::from_entry(entry, change, EventOrigin::Server));
        }
        events.extend(self.apply_released(released).await);
        let unheld = unheld.into_iter().filter(|event| {
            // The push of the record this create produced; the cache already
            // holds it under the real id.
            let echo = event.entity_id == entity_id
                && entry
                    .as_ref()
                    .is_some_and(|e| event.timestamp <= e.last_modified);
            if echo {
                debug!("Dropping server echo of create {} for {}", job.id, entity_id);
            }
            !echo
        });
        events.extend(self.route_unheld(unheld.collect()).await);

        debug!(
            "{:?} {} confirmed as {}/{}",
            job.kind, job.id, job.collection, entity_id
        );
        self.emit(CoordinatorEvent::Resolved(MutationOutcome {
            operation_id: job.id,
            kind: job.kind,
            state: MutationState::Confirmed,
            collection: job.collection,
            entity_id: entity_id.clone(),
            previous_id,
            entry,
            events,
            error: None,
        }));
        if let Some(reply) = reply {
            let _ = reply.send(Ok(MutationReceipt {
                operation_id: job.id,
                entity_id,
                payload,
                last_modified,
                conflict: resolved.conflict,
            }));
        }
        next
    }

    /// Writes the resolved state into the cache. Mutations still queued behind
    /// this one keep their optimistic effect on top of it.
    async fn settle_cache(
        &self,
        job: &Job,
        resolution: &Resolution,
        behind: &Behind,
    ) -> SyncResult<Option<CacheEntry>> {
        let cache = &self.cache;
        let owner = &self.account;
        match resolution {
            Resolution::Deleted(_) => {
                cache.delete(job.collection, owner, &job.target).await?;
                Ok(None)
            }
            _ if behind.deletes => {
                cache.delete(job.collection, owner, &job.target).await?;
                Ok(None)
            }
            Resolution::Written(record) | Resolution::Kept(record) => {
                let entry = if job.kind == MutationKind::Create {
                    cache
                        .rekey(
                            job.collection,
                            owner,
                            &job.target,
                            &record.id,
                            record.payload.clone(),
                            record.last_modified,
                        )
                        .await?
                } else {
                    cache
                        .confirm(
                            job.collection,
                            owner,
                            &record.id,
                            record.payload.clone(),
                            record.last_modified,
                        )
                        .await?
                };
                if behind.overlay.is_empty() {
                    return Ok(Some(entry));
                }
                let pending = CacheEntry {
                    payload: merged(&entry.payload, &behind.overlay),
                    synced: false,
                    ..entry
                };
                cache.restore(pending.clone()).await?;
                Ok(Some(pending))
            }
        }
    }

    async fn fail(&self, target: &Target, job: Job, err: SyncError) -> Target {
        warn!(
            "{:?} {} on {}/{} failed: {}",
            job.kind, job.id, job.collection, job.target, err
        );
        let (reply, dependents, released, unheld) = {
            let mut state = self.lock_state();
            let head = state.take(target, job.seq);
            state.failed.insert(job.id, FailedMutation::from(&job));
            // Nothing queued behind a failed create can ever be addressed.
            let dependents: Vec<PendingMutation> = if job.kind == MutationKind::Create {
                let seqs: Vec<u64> = state
                    .queues
                    .get(target)
                    .into_iter()
                    .flatten()
                    .map(|op| op.seq)
                    .collect();
                seqs.into_iter()
                    .filter_map(|seq| state.take(target, seq))
                    .collect()
            } else {
                Vec::new()
            };
            let released = state.release(target);
            let unheld = if job.kind == MutationKind::Create {
                state.unhold(job.collection, None)
            } else {
                Vec::new()
            };
            (head.and_then(|op| op.reply), dependents, released, unheld)
        };

        let mut events = self.apply_released(released).await;
        events.extend(self.route_unheld(unheld).await);
        self.emit(CoordinatorEvent::Resolved(MutationOutcome {
            operation_id: job.id,
            kind: job.kind,
            state: MutationState::Failed,
            collection: job.collection,
            entity_id: job.target.clone(),
            previous_id: None,
            entry: None,
            events,
            error: Some(err.clone()),
        }));
        if let Some(reply) = reply {
            let _ = reply.send(Err(err));
        }

        for mut op in dependents {
            let err = SyncError::Dependency(job.id);
            self.emit(CoordinatorEvent::Resolved(MutationOutcome {
                operation_id: op.id,
                kind: op.kind,
                state: MutationState::Failed,
                collection: op.collection,
                entity_id: op.target.clone(),
                previous_id: None,
                entry: None,
                events: Vec::new(),
                error: Some(err.clone()),
            }));
            if let Some(reply) = op.reply.take() {
                let _ = reply.send(Err(err));
            }
        }
        target.clone()
    }

    // ── Server events ────────────────────────────────────────────

    async fn apply_released(&self, released: Vec<SyncEvent>) -> Vec<SyncEvent> {
        let mut applied = Vec::new();
        for event in released {
            match self.apply_server(event).await {
                Ok(Some(event)) => applied.push(event),
                Ok(None) => {}
                Err(err) => warn!("Applying deferred server event failed: {}", err),
            }
        }
        applied
    }

    /// Sends events held behind creates through the usual intake: deferred
    /// if their entity now has a pending mutation, applied otherwise.
    async fn route_unheld(&self, unheld: Vec<SyncEvent>) -> Vec<SyncEvent> {
        let mut ready = Vec::new();
        {
            let mut state = self.lock_state();
            for event in unheld {
                let key = (event.collection, event.entity_id.clone());
                if state.is_pending(&key) {
                    state.deferred.entry(key).or_default().push(event);
                } else {
                    ready.push(event);
                }
            }
        }
        self.apply_released(ready).await
    }

    async fn apply_server(&self, event: SyncEvent) -> SyncResult<Option<SyncEvent>> {
        if event.is_removal() {
            self.cache
                .delete(event.collection, &self.account, &event.entity_id)
                .await?;
            return Ok(Some(event));
        }

        let entity = Entity::new(
            event.entity_id.clone(),
            self.account.clone(),
            event.collection,
            event.payload.clone(),
        );
        let entry = CacheEntry::synced(entity, event.timestamp, self.clock.now());
        match self.cache.put(entry).await? {
            PutOutcome::Stored { .. } => Ok(Some(event)),
            PutOutcome::Stale { stored } => {
                debug!(
                    "Ignoring stale server change for {}/{} ({} < {})",
                    event.collection, event.entity_id, event.timestamp, stored
                );
                Ok(None)
            }
        }
    }
}

fn plain_write(job: &Job) -> RemoteWrite {
    match job.kind {
        MutationKind::Create => RemoteWrite::Create {
            collection: job.collection,
            payload: job.payload.clone(),
        },
        MutationKind::Update => RemoteWrite::Update {
            collection: job.collection,
            id: job.target.clone(),
            patch: job.payload.clone(),
        },
        MutationKind::Delete => RemoteWrite::Delete {
            collection: job.collection,
            id: job.target.clone(),
        },
    }
}

/// The client's full view of the entity: its snapshot with the patch applied.
fn client_view(job: &Job) -> Payload {
    match &job.snapshot {
        Some(snapshot) => merged(&snapshot.payload, &job.payload),
        None => job.payload.clone(),
    }
}

/// The update that replays the failed updates of an entity.
fn replay(entry: CacheEntry, failed: Vec<FailedMutation>) -> Request {
    let mut updates = failed
        .into_iter()
        .filter(|f| f.kind == MutationKind::Update);
    match updates.next() {
        Some(first) => {
            let mut patch = first.payload;
            for later in updates {
                merge_patch(&mut patch, &later.payload);
            }
            Request {
                kind: MutationKind::Update,
                collection: entry.collection,
                target: entry.entity_id,
                payload: patch,
                snapshot: first.snapshot,
                base: first.base,
            }
        }
        None => Request {
            kind: MutationKind::Update,
            collection: entry.collection,
            target: entry.entity_id,
            payload: entry.payload,
            snapshot: None,
            base: Some(entry.last_modified),
        },
    }
}
