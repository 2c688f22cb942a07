//! Error types for the sync layer.

use std::time::Duration;
use tandem_cache::CacheError;
use tandem_remote::RemoteError;
use tandem_types::{Collection, EntityId, OperationId, Timestamp};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Only [`SyncError::Connectivity`] is transient; everything else ends the
/// operation that produced it.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// The remote store could not be reached. Retried with backoff.
    #[error("connectivity error: {message}")]
    Connectivity {
        message: String,
        /// Server-requested wait before the next attempt.
        retry_after_ms: Option<u64>,
    },

    /// The remote store refused the request (permissions, invalid data).
    #[error("rejected by remote store: {0}")]
    RemoteRejection(String),

    /// The server copy changed since the snapshot the write was based on.
    #[error("conflict on {collection}/{entity_id}: server modified at {server_modified}")]
    Conflict {
        collection: Collection,
        entity_id: EntityId,
        server_modified: Timestamp,
    },

    /// The local cache failed.
    #[error("cache error: {0}")]
    CacheIo(String),

    /// A mutation queued behind a create that failed.
    #[error("create {0} failed before this mutation could be sent")]
    Dependency(OperationId),

    /// The orchestrator has no active account session.
    #[error("sync engine not initialized")]
    NotInitialized,

    /// `initialize` called on a running session.
    #[error("sync engine already initialized")]
    AlreadyInitialized,

    /// No failed mutation with this id is awaiting rollback.
    #[error("unknown operation: {0}")]
    UnknownOperation(OperationId),

    /// The task that owned a result was shut down.
    #[error("channel closed")]
    ChannelClosed,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether the failed call may succeed if retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Connectivity { .. })
    }

    /// Minimum wait requested by the server before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Connectivity {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        if err.is_transient() {
            SyncError::Connectivity {
                retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
                message: err.to_string(),
            }
        } else {
            SyncError::RemoteRejection(err.to_string())
        }
    }
}

impl From<CacheError> for SyncError {
    fn from(err: CacheError) -> Self {
        SyncError::CacheIo(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}
