//! Shared helpers for the sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tandem_remote::memory::MemoryRemote;
use tandem_remote::{ChangeFeed, Query, RemoteRecord, RemoteResult, RemoteStore, RemoteWrite, WriteOutcome};
use tandem_sync::{ChannelConfig, MutationConfig, RetryPolicy, Subscription, SyncConfig};
use tandem_types::{AccountId, Collection, EntityId, Payload, SyncEvent};
use tokio::sync::Semaphore;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn payload(v: serde_json::Value) -> Payload {
    v.as_object().cloned().unwrap()
}

pub fn account() -> AccountId {
    AccountId::from("acct-1")
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        base_delay_ms: 5,
        multiplier: 2,
        max_delay_ms: 20,
    }
}

/// Millisecond backoff and two collections, so tests settle quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        mutation: MutationConfig {
            max_retries: 2,
            retry: fast_retry(),
            ..MutationConfig::default()
        },
        channel: ChannelConfig { retry: fast_retry() },
        collections: vec![Collection::Activity, Collection::Rule],
        ..SyncConfig::default()
    }
}

pub async fn next_event(sub: &mut Subscription) -> SyncEvent {
    tokio::time::timeout(WAIT, sub.next())
        .await
        .expect("timed out waiting for an event")
        .expect("subscription ended")
}

/// Reads events until one matches `pred`. Returns everything read, the match
/// last.
pub async fn events_until(
    sub: &mut Subscription,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(sub).await;
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Polls `cond` until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A [`MemoryRemote`] whose writes wait for a permit, so tests can hold a
/// mutation in flight.
#[derive(Clone)]
pub struct HeldRemote {
    pub inner: MemoryRemote,
    permits: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
    /// Apply the write first and hold only the acknowledgement.
    ack_late: bool,
}

impl HeldRemote {
    pub fn new(inner: MemoryRemote) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(0)),
            waiting: Arc::new(AtomicUsize::new(0)),
            ack_late: false,
        }
    }

    /// Writes land on the server (and are pushed to feeds) right away, but
    /// their results are held.
    pub fn acking_late(inner: MemoryRemote) -> Self {
        Self {
            ack_late: true,
            ..Self::new(inner)
        }
    }

    /// Lets `n` held writes through.
    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Writes currently blocked.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn hold(&self) {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for HeldRemote {
    async fn subscribe(&self, query: &Query, resume_after: Option<u64>) -> RemoteResult<ChangeFeed> {
        self.inner.subscribe(query, resume_after).await
    }

    async fn get(
        &self,
        account: &AccountId,
        collection: Collection,
        id: &EntityId,
    ) -> RemoteResult<Option<RemoteRecord>> {
        self.inner.get(account, collection, id).await
    }

    async fn write(&self, account: &AccountId, write: RemoteWrite) -> RemoteResult<WriteOutcome> {
        if self.ack_late {
            let outcome = self.inner.write(account, write).await;
            self.hold().await;
            return outcome;
        }
        self.hold().await;
        self.inner.write(account, write).await
    }

    async fn commit_batch(
        &self,
        account: &AccountId,
        writes: Vec<RemoteWrite>,
    ) -> RemoteResult<Vec<WriteOutcome>> {
        if self.ack_late {
            let outcomes = self.inner.commit_batch(account, writes).await;
            self.hold().await;
            return outcomes;
        }
        self.hold().await;
        self.inner.commit_batch(account, writes).await
    }
}
