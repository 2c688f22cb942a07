//! Synchronization orchestrator.
//!
//! Ties one account session together: the durable cache, a push channel per
//! collection, the mutation coordinator, and the subscribers that want a
//! merged view of all three.
//!
//! Everything published to subscribers goes through one dispatch lock.
//! Holding it while replaying the cache, applying a server event or making an
//! optimistic write keeps each subscriber's stream in the same order as the
//! changes hit the cache.

use crate::channel::{self, ChannelHandle, ChannelSink};
use crate::config::SyncConfig;
use crate::coordinator::MutationCoordinator;
use crate::error::{SyncError, SyncResult};
use crate::mutation::{CoordinatorEvent, CreateHandle, MutationHandle};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tandem_cache::CacheStore;
use tandem_remote::{Query, RemoteStore};
use tandem_types::{
    AccountId, CacheEntry, ChangeKind, Clock, Collection, EntityId, EventOrigin, OperationId,
    Payload, SubscriptionId, SyncEvent, SystemClock, Timestamp,
};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered channel failures per `channel_errors()` receiver.
const CHANNEL_ERROR_CAPACITY: usize = 64;

/// Engine health as seen by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Online and every push channel is subscribed.
    pub connected: bool,
    pub pending_operation_count: usize,
    pub unsynced_cache_count: usize,
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

/// Result of [`SyncOrchestrator::force_resync`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncSummary {
    pub replayed: usize,
    pub confirmed: usize,
    pub failed: usize,
}

/// A push channel failure, as reported to `channel_errors()` receivers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFailure {
    pub collection: Collection,
    pub error: SyncError,
}

/// A live view of one collection.
///
/// Starts with the cached entries (origin `Cache`), then carries every change
/// that reaches the cache. Dropping it or calling
/// [`SyncOrchestrator::unsubscribe`] ends delivery.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    collection: Collection,
    events: mpsc::UnboundedReceiver<SyncEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Waits for the next event. `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Returns an already delivered event without waiting.
    pub fn try_next(&mut self) -> Option<SyncEvent> {
        self.events.try_recv().ok()
    }
}

struct Subscriber {
    collection: Collection,
    tx: mpsc::UnboundedSender<SyncEvent>,
}

#[derive(Default)]
struct Hub {
    /// Also the dispatch lock.
    subscribers: AsyncMutex<HashMap<SubscriptionId, Subscriber>>,
    last_full_sync: Mutex<Option<DateTime<Utc>>>,
}

impl Hub {
    fn mark_full_sync(&self, at: Timestamp) {
        *self
            .last_full_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at.to_datetime());
    }

    fn last_full_sync(&self) -> Option<DateTime<Utc>> {
        *self
            .last_full_sync
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn publish(subscribers: &mut HashMap<SubscriptionId, Subscriber>, events: &[SyncEvent]) {
    if events.is_empty() {
        return;
    }
    subscribers.retain(|id, sub| {
        for event in events.iter().filter(|e| e.collection == sub.collection) {
            if sub.tx.send(event.clone()).is_err() {
                debug!("Subscriber {} went away", id);
                return false;
            }
        }
        true
    });
}

enum Inbound {
    Server(SyncEvent),
    ChannelError(ChannelFailure),
}

/// Forwards channel output into the session's pump.
struct PumpSink {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl ChannelSink for PumpSink {
    fn on_event(&self, event: SyncEvent) {
        let _ = self.tx.send(Inbound::Server(event));
    }

    fn on_error(&self, collection: Collection, error: SyncError) {
        let _ = self
            .tx
            .send(Inbound::ChannelError(ChannelFailure { collection, error }));
    }
}

struct Session {
    account: AccountId,
    cache: CacheStore,
    coordinator: Arc<MutationCoordinator>,
    channels: Vec<ChannelHandle>,
    hub: Arc<Hub>,
    pump: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for channel in &self.channels {
            channel.close();
        }
        self.coordinator.shutdown();
        self.pump.abort();
    }
}

/// The sync engine for one account session.
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    online: watch::Sender<bool>,
    channel_errors: broadcast::Sender<ChannelFailure>,
    session: Option<Session>,
}

impl SyncOrchestrator {
    /// Creates an orchestrator. Nothing runs until [`initialize`](Self::initialize).
    pub fn new(remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        Self::with_clock(remote, config, Arc::new(SystemClock))
    }

    /// Creates an orchestrator reading time from `clock`.
    pub fn with_clock(remote: Arc<dyn RemoteStore>, config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let (online, _) = watch::channel(true);
        let (channel_errors, _) = broadcast::channel(CHANNEL_ERROR_CAPACITY);
        Self {
            remote,
            config,
            clock,
            online,
            channel_errors,
            session: None,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.session.is_some()
    }

    /// The account of the active session.
    pub fn account(&self) -> Option<&AccountId> {
        self.session.as_ref().map(|s| &s.account)
    }

    /// Opens the account's cache, starts the coordinator and a push channel
    /// per configured collection.
    ///
    /// If the configured cache cannot be opened the session runs on an
    /// in-memory cache instead.
    pub async fn initialize(&mut self, account: AccountId) -> SyncResult<()> {
        if self.session.is_some() {
            return Err(SyncError::AlreadyInitialized);
        }

        let cache = self.open_cache()?;
        let (coordinator, outcomes) = MutationCoordinator::start(
            account.clone(),
            self.remote.clone(),
            cache.clone(),
            self.config.mutation,
            self.clock.clone(),
            self.online.subscribe(),
        );
        let coordinator = Arc::new(coordinator);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn ChannelSink> = Arc::new(PumpSink { tx: inbound_tx });
        let channels: Vec<ChannelHandle> = self
            .config
            .collections
            .iter()
            .map(|&collection| {
                let query =
                    Query::new(account.clone(), collection).with_filter(self.config.filter(collection));
                channel::open(self.remote.clone(), query, self.config.channel, sink.clone())
            })
            .collect();

        let hub = Arc::new(Hub::default());
        let pump = tokio::spawn(run_pump(
            hub.clone(),
            coordinator.clone(),
            inbound_rx,
            outcomes,
            self.channel_errors.clone(),
            self.clock.clone(),
        ));

        info!(
            "Sync session started for {} ({} channels)",
            account,
            channels.len()
        );
        self.session = Some(Session {
            account,
            cache,
            coordinator,
            channels,
            hub,
            pump,
        });
        Ok(())
    }

    fn open_cache(&self) -> SyncResult<CacheStore> {
        match CacheStore::open(self.config.cache.clone(), self.clock.clone()) {
            Ok(cache) => Ok(cache),
            Err(err) => {
                warn!("Cache unavailable ({}), falling back to an in-memory cache", err);
                Ok(CacheStore::open_in_memory(
                    self.config.cache.clone(),
                    self.clock.clone(),
                )?)
            }
        }
    }

    fn session(&self) -> SyncResult<&Session> {
        self.session.as_ref().ok_or(SyncError::NotInitialized)
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Subscribes to a collection. The cached entries are replayed first.
    pub async fn subscribe(&self, collection: Collection) -> SyncResult<Subscription> {
        let session = self.session()?;
        let mut subscribers = session.hub.subscribers.lock().await;

        let (tx, events) = mpsc::unbounded_channel();
        match session
            .cache
            .get_all_for_owner(collection, &session.account)
            .await
        {
            Ok(entries) => {
                for entry in &entries {
                    let _ = tx.send(SyncEvent::from_entry(entry, ChangeKind::Added, EventOrigin::Cache));
                }
            }
            Err(err) => warn!("Cache replay for {} failed: {}", collection, err),
        }

        let id = SubscriptionId::new();
        subscribers.insert(id, Subscriber { collection, tx });
        debug!("Subscription {} opened on {}", id, collection);
        Ok(Subscription {
            id,
            collection,
            events,
        })
    }

    /// Stops delivery to a subscription. Returns false if it was unknown.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> SyncResult<bool> {
        let session = self.session()?;
        let removed = session.hub.subscribers.lock().await.remove(&id).is_some();
        Ok(removed)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Reads the cached copy of an entity. Temporary ids of confirmed creates
    /// resolve to the real id.
    pub async fn get(&self, collection: Collection, id: &EntityId) -> SyncResult<Option<CacheEntry>> {
        let session = self.session()?;
        let id = session.coordinator.resolve_id(id);
        Ok(session.cache.get(collection, &session.account, &id).await?)
    }

    /// Every cached entity of a collection.
    pub async fn list(&self, collection: Collection) -> SyncResult<Vec<CacheEntry>> {
        let session = self.session()?;
        Ok(session
            .cache
            .get_all_for_owner(collection, &session.account)
            .await?)
    }

    // ── Mutations ────────────────────────────────────────────────

    pub async fn create(&self, collection: Collection, payload: Payload) -> SyncResult<CreateHandle> {
        let session = self.session()?;
        let mut subscribers = session.hub.subscribers.lock().await;
        let submitted = session.coordinator.create(collection, payload).await?;
        publish(&mut subscribers, std::slice::from_ref(&submitted.event));
        Ok(submitted.handle)
    }

    pub async fn update(
        &self,
        collection: Collection,
        id: &EntityId,
        patch: Payload,
        snapshot: Option<CacheEntry>,
    ) -> SyncResult<MutationHandle> {
        let session = self.session()?;
        let mut subscribers = session.hub.subscribers.lock().await;
        let submitted = session
            .coordinator
            .update(collection, id, patch, snapshot)
            .await?;
        publish(&mut subscribers, std::slice::from_ref(&submitted.event));
        Ok(submitted.handle)
    }

    pub async fn delete(
        &self,
        collection: Collection,
        id: &EntityId,
        snapshot: Option<CacheEntry>,
    ) -> SyncResult<MutationHandle> {
        let session = self.session()?;
        let mut subscribers = session.hub.subscribers.lock().await;
        let submitted = session.coordinator.delete(collection, id, snapshot).await?;
        publish(&mut subscribers, std::slice::from_ref(&submitted.event));
        Ok(submitted.handle)
    }

    /// Reverts the optimistic write of a failed mutation.
    pub async fn rollback(&self, operation_id: OperationId) -> SyncResult<()> {
        let session = self.session()?;
        let mut subscribers = session.hub.subscribers.lock().await;
        let event = session.coordinator.rollback(operation_id).await?;
        publish(&mut subscribers, std::slice::from_ref(&event));
        Ok(())
    }

    /// Failed mutations that can be rolled back.
    pub fn failed_operations(&self) -> SyncResult<Vec<OperationId>> {
        Ok(self.session()?.coordinator.failed_operations())
    }

    // ── Status & control ─────────────────────────────────────────

    pub async fn status(&self) -> SyncResult<SyncStatus> {
        let session = self.session()?;
        let online = *self.online.borrow();
        let connected = online && session.channels.iter().all(ChannelHandle::is_connected);
        let unsynced_cache_count = match session.cache.stats(&session.account).await {
            Ok(stats) => stats.unsynced,
            Err(err) => {
                warn!("Cache stats unavailable: {}", err);
                0
            }
        };
        Ok(SyncStatus {
            connected,
            pending_operation_count: session.coordinator.pending_count(),
            unsynced_cache_count,
            last_full_sync_at: session.hub.last_full_sync(),
        })
    }

    /// Reports connectivity. While offline, mutations are parked in the
    /// outbox; going online flushes it.
    pub fn set_online(&self, online: bool) {
        let previous = self.online.send_replace(online);
        if previous != online {
            info!("Connectivity changed: {}", if online { "online" } else { "offline" });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Receives every push channel failure from now on.
    pub fn channel_errors(&self) -> broadcast::Receiver<ChannelFailure> {
        self.channel_errors.subscribe()
    }

    /// Replays every unsynced cache entry through the coordinator and waits
    /// for the results. Entries with a mutation already in flight are left to
    /// it.
    pub async fn force_resync(&self) -> SyncResult<ResyncSummary> {
        let session = self.session()?;
        let mut handles = Vec::new();
        for &collection in &self.config.collections {
            let entries = session
                .cache
                .get_unsynced(collection, &session.account)
                .await?;
            for entry in entries {
                if let Some(handle) = session.coordinator.resubmit(entry).await? {
                    handles.push(handle);
                }
            }
        }

        info!("Resync replaying {} unsynced entries", handles.len());
        let results = join_all(handles.into_iter().map(MutationHandle::wait)).await;
        let confirmed = results.iter().filter(|r| r.is_ok()).count();
        let summary = ResyncSummary {
            replayed: results.len(),
            confirmed,
            failed: results.len() - confirmed,
        };
        if summary.failed == 0 {
            session.hub.mark_full_sync(self.clock.now());
        } else {
            warn!("Resync finished with {} failures", summary.failed);
        }
        Ok(summary)
    }

    /// Closes the channels, stops the coordinator and releases the cache.
    /// Pending mutations stay unsynced in a file-backed cache and are replayed
    /// by `force_resync` in the next session.
    pub async fn teardown(&mut self) -> SyncResult<()> {
        let session = self.session.take().ok_or(SyncError::NotInitialized)?;
        session.hub.subscribers.lock().await.clear();
        info!("Sync session for {} torn down", session.account);
        drop(session);
        Ok(())
    }

    /// Tears the session down and deletes the account's cached data.
    pub async fn teardown_and_wipe(&mut self) -> SyncResult<usize> {
        let session = self.session.take().ok_or(SyncError::NotInitialized)?;
        session.hub.subscribers.lock().await.clear();
        for channel in &session.channels {
            channel.close();
        }
        session.coordinator.shutdown();
        let removed = session.cache.clear_owner(&session.account).await?;
        info!(
            "Sync session for {} torn down, {} cache entries wiped",
            session.account, removed
        );
        Ok(removed)
    }
}

async fn run_pump(
    hub: Arc<Hub>,
    coordinator: Arc<MutationCoordinator>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut outcomes: mpsc::UnboundedReceiver<CoordinatorEvent>,
    channel_errors: broadcast::Sender<ChannelFailure>,
    clock: Arc<dyn Clock>,
) {
    loop {
        tokio::select! {
            Some(message) = inbound.recv() => match message {
                Inbound::Server(event) => {
                    let mut subscribers = hub.subscribers.lock().await;
                    match coordinator.absorb(event.clone()).await {
                        Ok(Some(applied)) => publish(&mut subscribers, std::slice::from_ref(&applied)),
                        Ok(None) => {}
                        Err(err) => {
                            warn!(
                                "Cache write for server change on {}/{} failed: {}",
                                event.collection, event.entity_id, err
                            );
                            publish(&mut subscribers, std::slice::from_ref(&event));
                        }
                    }
                }
                Inbound::ChannelError(failure) => {
                    let _ = channel_errors.send(failure);
                }
            },
            Some(event) = outcomes.recv() => match event {
                CoordinatorEvent::Resolved(outcome) => {
                    if !outcome.events.is_empty() {
                        let mut subscribers = hub.subscribers.lock().await;
                        publish(&mut subscribers, &outcome.events);
                    }
                }
                CoordinatorEvent::OutboxFlushed { failed: 0, .. } => {
                    hub.mark_full_sync(clock.now());
                }
                CoordinatorEvent::OutboxFlushed { .. } => {}
            },
            else => break,
        }
    }
}
