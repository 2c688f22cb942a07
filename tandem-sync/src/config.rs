use crate::error::SyncResult;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tandem_cache::CacheConfig;
use tandem_remote::Filter;
use tandem_types::Collection;

/// How a write is resolved when the server copy changed after the caller's
/// snapshot was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Discard the local change and adopt the server copy.
    ServerWins,
    /// Overwrite the server copy with the client's full view.
    ClientWins,
    /// Shallow-merge the patch over the server fields.
    #[default]
    Merge,
    /// Fail the mutation with a conflict error.
    Fail,
}

/// Mutation retry and conflict settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Retries after the first attempt before a mutation fails.
    pub max_retries: u32,
    pub retry: RetryPolicy,
    pub conflict_policy: ConflictPolicy,
    /// How long a temporary id keeps resolving to its real id after the
    /// create is confirmed.
    pub alias_ttl_ms: u64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry: RetryPolicy::mutations(),
            conflict_policy: ConflictPolicy::Merge,
            alias_ttl_ms: 15 * 60 * 1000,
        }
    }
}

impl MutationConfig {
    pub fn alias_ttl(&self) -> Duration {
        Duration::from_millis(self.alias_ttl_ms)
    }
}

/// Push channel settings. Reconnection is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub retry: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::reconnect(),
        }
    }
}

/// Configuration for one sync session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub mutation: MutationConfig,
    pub channel: ChannelConfig,
    /// Collections with a push channel and cache replay.
    pub collections: Vec<Collection>,
    /// Push filters per collection. Collections without one receive every
    /// record of the account.
    pub filters: HashMap<Collection, Filter>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            mutation: MutationConfig::default(),
            channel: ChannelConfig::default(),
            collections: Collection::ALL.to_vec(),
            filters: HashMap::new(),
        }
    }
}

impl SyncConfig {
    /// Parses a JSON document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// The push filter for `collection`.
    pub fn filter(&self, collection: Collection) -> Filter {
        self.filters.get(&collection).cloned().unwrap_or_default()
    }

    /// Reads and parses a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            crate::SyncError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }
}
