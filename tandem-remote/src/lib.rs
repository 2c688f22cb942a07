//! Remote store contract for Tandem.
//!
//! The sync engine never speaks a wire protocol of its own. It consumes a
//! backing service that offers:
//! - push subscriptions by query, resumable from a server sequence number
//! - single-record reads and writes with server-assigned timestamps
//! - atomic multi-record batch commits
//!
//! [`RemoteStore`] captures that contract. [`memory::MemoryRemote`] is a
//! complete in-process implementation used by tests and the CLI simulator.

mod error;
pub mod memory;
mod query;
mod store;

pub use error::{RemoteError, RemoteResult};
pub use query::{FieldCondition, Filter, Query};
pub use store::{ChangeFeed, RemoteChange, RemoteRecord, RemoteStore, RemoteWrite, WriteOutcome};
