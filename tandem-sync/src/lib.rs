//! Offline-first sync engine for Tandem.
//!
//! Keeps a durable local copy of an account's entities in step with a remote
//! document store that pushes changes in real time, and lets callers write
//! while offline.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Channel**: one push subscription per collection, reconnecting with
//!   backoff and delivering server changes in per-entity order
//! - **Coordinator**: applies local writes to the cache immediately, sends
//!   them in the background with retry, resolves conflicts and parks writes
//!   in an outbox while offline
//! - **Orchestrator**: owns the session; merges cache replay, server changes
//!   and local writes into one ordered stream per subscriber
//!
//! ## Write Path
//!
//! 1. **Optimistic write**: the cache is updated (unsynced) and a local event
//!    is published
//! 2. **Send**: the mutation is written to the remote store, or parked
//!    while offline
//! 3. **Confirm**: the server copy replaces the optimistic one and the cache
//!    entry is marked synced
//! 4. **Fail**: the entry stays unsynced until rolled back or resynced
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_remote::memory::MemoryRemote;
//! use tandem_sync::{SyncConfig, SyncOrchestrator};
//! use tandem_types::{AccountId, Collection, Payload};
//!
//! # async fn run() -> tandem_sync::SyncResult<()> {
//! let remote = Arc::new(MemoryRemote::new());
//! let mut engine = SyncOrchestrator::new(remote, SyncConfig::default());
//! engine.initialize(AccountId::new("alice")).await?;
//!
//! let mut activities = engine.subscribe(Collection::Activity).await?;
//! let created = engine.create(Collection::Activity, Payload::new()).await?;
//! let receipt = created.wait().await?;
//! println!("created {}", receipt.entity_id);
//! # let _ = activities.next().await;
//! # Ok(())
//! # }
//! ```

mod channel;
mod config;
mod coordinator;
mod error;
mod mutation;
mod orchestrator;
mod retry;

pub use channel::{ChannelHandle, ChannelSink, open as open_channel};
pub use config::{ChannelConfig, ConflictPolicy, MutationConfig, SyncConfig};
pub use coordinator::MutationCoordinator;
pub use error::{SyncError, SyncResult};
pub use mutation::{
    CoordinatorEvent, CreateHandle, MutationHandle, MutationKind, MutationOutcome,
    MutationReceipt, MutationState, Submitted,
};
pub use orchestrator::{ChannelFailure, ResyncSummary, Subscription, SyncOrchestrator, SyncStatus};
pub use retry::RetryPolicy;
