//! Durable entity cache for Tandem.
//!
//! Keeps the client-held copy of every synchronized entity so the engine can
//! serve reads and accept writes while the remote store is unreachable.
//!
//! # Architecture
//!
//! - One SQLite table keyed by `(owner, collection, entity_id)` with a
//!   secondary index on `(owner, collection, captured_at)`
//! - Each `(owner, collection)` partition has a max age and a max entry count;
//!   expired entries are pruned lazily on read, the oldest captures are
//!   evicted when an insert pushes a partition over its cap
//! - Every operation on a partition waits its turn in that partition's FIFO
//!   queue, so concurrent callers never interleave inside one entry
//! - SQLite work runs on the blocking thread pool

mod config;
mod error;
mod store;

pub use config::{CacheConfig, DEFAULT_MAX_AGE_MS, DEFAULT_MAX_ENTRIES, PartitionLimits};
pub use error::{CacheError, CacheResult};
pub use store::{CacheStats, CacheStore, PatchOutcome, PutOutcome};
