use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tandem_types::Collection;

/// Seven days.
pub const DEFAULT_MAX_AGE_MS: u64 = 7 * 24 * 60 * 60 * 1000;
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Configuration for the cache store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Database file. `None` keeps the cache in memory.
    pub path: Option<PathBuf>,
    /// Maximum age of an entry before it expires (ms).
    pub max_age_ms: u64,
    /// Maximum entries per `(owner, collection)` partition.
    pub max_entries: usize,
    /// Per-collection limits that replace the defaults above.
    pub overrides: HashMap<Collection, PartitionLimits>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_age_ms: DEFAULT_MAX_AGE_MS,
            max_entries: DEFAULT_MAX_ENTRIES,
            overrides: HashMap::new(),
        }
    }
}

/// Limits for one collection. Unset fields fall back to the global value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLimits {
    pub max_age_ms: Option<u64>,
    pub max_entries: Option<usize>,
}

impl CacheConfig {
    /// Max age that applies to `collection`.
    pub fn max_age(&self, collection: Collection) -> Duration {
        let ms = self
            .overrides
            .get(&collection)
            .and_then(|l| l.max_age_ms)
            .unwrap_or(self.max_age_ms);
        Duration::from_millis(ms)
    }

    /// Entry cap that applies to `collection`.
    pub fn max_entries(&self, collection: Collection) -> usize {
        self.overrides
            .get(&collection)
            .and_then(|l| l.max_entries)
            .unwrap_or(self.max_entries)
    }
}
