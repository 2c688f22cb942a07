//! Remote subscription channel.
//!
//! Keeps one push subscription open for a `(account, collection, filter)`
//! query and forwards every change to a [`ChannelSink`] as a server-origin
//! [`SyncEvent`].
//!
//! - Per entity id, changes are delivered in server sequence order. After a
//!   reconnect the subscription resumes after the last delivered sequence and
//!   anything not newer than what was already delivered for that id is dropped.
//!   A removed id is forgotten; later changes for it must be newer than the
//!   removal.
//! - Transient failures reconnect with backoff, forever. The first failure of
//!   an outage is reported once; the rest of the outage stays silent.
//! - A non-transient failure is reported once and stops the channel.

use crate::config::ChannelConfig;
use crate::error::SyncError;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tandem_remote::{Query, RemoteChange, RemoteError, RemoteStore};
use tandem_types::{ChangeKind, Collection, EntityId, EventOrigin, SyncEvent};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives what a channel delivers. Called from the channel's task.
pub trait ChannelSink: Send + Sync + 'static {
    fn on_event(&self, event: SyncEvent);

    fn on_error(&self, collection: Collection, error: SyncError);
}

#[derive(Default)]
struct ChannelFlags {
    closed: AtomicBool,
    connected: AtomicBool,
}

/// Handle to a running channel. Dropping it closes the channel.
pub struct ChannelHandle {
    collection: Collection,
    flags: Arc<ChannelFlags>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Whether a subscription is currently established.
    pub fn is_connected(&self) -> bool {
        !self.flags.closed.load(Ordering::SeqCst) && self.flags.connected.load(Ordering::SeqCst)
    }

    /// Whether the channel has stopped, either closed or after a fatal error.
    pub fn is_stopped(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst) || self.task.is_finished()
    }

    /// Stops delivery immediately. A network call in flight is abandoned and
    /// its result discarded.
    pub fn close(&self) {
        if !self.flags.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing {} channel", self.collection);
        }
        self.flags.connected.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a channel for `query` and starts its task.
pub fn open(
    remote: Arc<dyn RemoteStore>,
    query: Query,
    config: ChannelConfig,
    sink: Arc<dyn ChannelSink>,
) -> ChannelHandle {
    let collection = query.collection;
    let flags = Arc::new(ChannelFlags::default());
    let worker = ChannelWorker {
        remote,
        query,
        config,
        sink,
        flags: flags.clone(),
        resume_after: None,
        delivered: HashMap::new(),
        removed_floor: 0,
    };
    let task = tokio::spawn(worker.run());
    ChannelHandle {
        collection,
        flags,
        task,
    }
}

struct ChannelWorker {
    remote: Arc<dyn RemoteStore>,
    query: Query,
    config: ChannelConfig,
    sink: Arc<dyn ChannelSink>,
    flags: Arc<ChannelFlags>,
    /// Highest sequence seen on any feed.
    resume_after: Option<u64>,
    /// Last delivered sequence per live entity id.
    delivered: HashMap<EntityId, u64>,
    /// Highest sequence of a delivered removal. Ids are forgotten once
    /// removed; anything older than this for an unknown id is a replay.
    removed_floor: u64,
}

impl ChannelWorker {
    async fn run(mut self) {
        let collection = self.query.collection;
        let mut attempt: u32 = 0;
        let mut reported = false;

        loop {
            if self.is_closed() {
                return;
            }

            let failure = match self.remote.subscribe(&self.query, self.resume_after).await {
                Ok(mut feed) => {
                    if self.is_closed() {
                        return;
                    }
                    self.flags.connected.store(true, Ordering::SeqCst);
                    if attempt > 0 {
                        info!("{} channel reconnected after {} attempts", collection, attempt);
                    } else {
                        debug!("{} channel subscribed", collection);
                    }
                    attempt = 0;
                    reported = false;

                    let failure = loop {
                        match feed.recv().await {
                            Some(Ok(change)) => {
                                if self.is_closed() {
                                    return;
                                }
                                self.deliver(change);
                            }
                            Some(Err(err)) => break err,
                            None => break RemoteError::Unavailable("feed closed".into()),
                        }
                    };
                    self.flags.connected.store(false, Ordering::SeqCst);
                    failure
                }
                Err(err) => err,
            };

            if self.is_closed() {
                return;
            }

            if !failure.is_transient() {
                warn!("{} channel stopped: {}", collection, failure);
                self.sink.on_error(collection, failure.into());
                return;
            }

            if !reported {
                reported = true;
                warn!("{} channel lost: {}", collection, failure);
                self.sink.on_error(collection, failure.clone().into());
            }

            attempt = attempt.saturating_add(1);
            let delay = self
                .config
                .retry
                .delay_at_least(attempt, failure.retry_after());
            debug!(
                "{} channel reconnecting in {:?} (attempt {})",
                collection, delay, attempt
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn deliver(&mut self, change: RemoteChange) {
        self.resume_after = Some(
            self.resume_after
                .map_or(change.sequence, |seen| seen.max(change.sequence)),
        );

        let last = self.delivered.get(&change.id).copied().unwrap_or(self.removed_floor);
        if change.sequence <= last {
            debug!(
                "Dropping out-of-order change for {} (seq {} <= {})",
                change.id, change.sequence, last
            );
            return;
        }
        if change.kind == ChangeKind::Removed {
            self.delivered.remove(&change.id);
            self.removed_floor = self.removed_floor.max(change.sequence);
        } else {
            self.delivered.insert(change.id.clone(), change.sequence);
        }

        self.sink.on_event(SyncEvent::new(
            change.kind,
            self.query.collection,
            change.id,
            change.payload,
            change.last_modified,
            EventOrigin::Server,
        ));
    }

    fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::SeqCst)
    }
}
