//! SQLite-backed cache store.
//!
//! All entries live in one `cache_entries` table. Reads and writes for a
//! partition are funnelled through a per-partition async queue and then run on
//! the blocking pool against the shared connection.

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tandem_types::{AccountId, CacheEntry, Clock, Collection, EntityId, Payload, Timestamp, merged};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

type PartitionKey = (AccountId, Collection);

const ENTRY_COLUMNS: &str =
    "entity_id, owner, collection, payload, captured_at, last_modified, synced";

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum PutOutcome {
    /// The entry was written; `evicted` lists entries dropped to respect the cap.
    Stored { evicted: Vec<EntityId> },
    /// The cache already holds a newer version of the entity.
    Stale { stored: Timestamp },
}

impl PutOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, PutOutcome::Stored { .. })
    }
}

/// Result of an optimistic read-merge-write.
#[derive(Debug, Clone)]
pub struct PatchOutcome {
    /// The entry as it was before the patch, if any.
    pub before: Option<CacheEntry>,
    /// The entry as written.
    pub after: CacheEntry,
    pub evicted: Vec<EntityId>,
}

/// Cache statistics for one owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total: usize,
    pub unsynced: usize,
    pub per_collection: BTreeMap<Collection, usize>,
    pub oldest_captured_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    max_age: Duration,
    max_entries: usize,
}

impl Limits {
    /// Entries captured before this instant are expired.
    fn cutoff(&self, now: Timestamp) -> i64 {
        now.as_millis()
            .saturating_sub(self.max_age.as_millis() as u64) as i64
    }

    fn is_expired(&self, entry: &CacheEntry, now: Timestamp) -> bool {
        now.since(entry.captured_at) > self.max_age
    }
}

/// Durable per-entity cache with expiry and capacity eviction.
#[derive(Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
    config: Arc<CacheConfig>,
    clock: Arc<dyn Clock>,
    queues: Arc<Mutex<HashMap<PartitionKey, Arc<AsyncMutex<()>>>>>,
}

impl CacheStore {
    /// Opens (or creates) the cache described by `config`.
    pub fn open(config: CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        let conn = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                info!("Opening cache store at {}", path.display());
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config: Arc::new(config),
            clock,
            queues: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Opens an in-memory cache with the limits of `config`.
    pub fn open_in_memory(config: CacheConfig, clock: Arc<dyn Clock>) -> CacheResult<Self> {
        Self::open(CacheConfig { path: None, ..config }, clock)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ── Entry operations ─────────────────────────────────────────

    /// Writes an entry unless the cache holds a newer `last_modified` for it.
    /// `captured_at` is stamped by the cache.
    pub async fn put(&self, entry: CacheEntry) -> CacheResult<PutOutcome> {
        let owner = entry.owner.clone();
        let collection = entry.collection;
        self.run(&owner, collection, move |conn, limits, now| {
            let tx = conn.transaction()?;
            if let Some(stored) = fetch(&tx, &entry.owner, entry.collection, &entry.entity_id)? {
                if !limits.is_expired(&stored, now) && stored.last_modified > entry.last_modified {
                    return Ok(PutOutcome::Stale {
                        stored: stored.last_modified,
                    });
                }
            }
            upsert(&tx, &entry, now)?;
            let evicted = evict(&tx, &entry.owner, entry.collection, limits)?;
            tx.commit()?;
            Ok(PutOutcome::Stored { evicted })
        })
        .await
    }

    /// Writes an entry unconditionally. Used to roll back to a snapshot.
    pub async fn restore(&self, entry: CacheEntry) -> CacheResult<Vec<EntityId>> {
        let owner = entry.owner.clone();
        let collection = entry.collection;
        self.run(&owner, collection, move |conn, limits, now| {
            let tx = conn.transaction()?;
            upsert(&tx, &entry, now)?;
            let evicted = evict(&tx, &entry.owner, entry.collection, limits)?;
            tx.commit()?;
            Ok(evicted)
        })
        .await
    }

    /// Reads an entry. An expired entry is deleted and reported as absent.
    pub async fn get(
        &self,
        collection: Collection,
        owner: &AccountId,
        id: &EntityId,
    ) -> CacheResult<Option<CacheEntry>> {
        let (owner_c, id) = (owner.clone(), id.clone());
        self.run(owner, collection, move |conn, limits, now| {
            match fetch(conn, &owner_c, collection, &id)? {
                Some(entry) if limits.is_expired(&entry, now) => {
                    delete_row(conn, &owner_c, collection, &id)?;
                    debug!("Cache entry {}/{} expired on read", collection, id);
                    Ok(None)
                }
                other => Ok(other),
            }
        })
        .await
    }

    /// Every live entry of a partition, oldest capture first. Expired entries
    /// are deleted as a side effect.
    pub async fn get_all_for_owner(
        &self,
        collection: Collection,
        owner: &AccountId,
    ) -> CacheResult<Vec<CacheEntry>> {
        let owner_c = owner.clone();
        self.run(owner, collection, move |conn, limits, now| {
            prune_expired(conn, &owner_c, collection, limits, now)?;
            select_entries(
                conn,
                "WHERE owner = ?1 AND collection = ?2 ORDER BY captured_at ASC, rowid ASC",
                params![owner_c.as_str(), collection.as_str()],
            )
        })
        .await
    }

    /// Live entries whose local write is not yet confirmed.
    pub async fn get_unsynced(
        &self,
        collection: Collection,
        owner: &AccountId,
    ) -> CacheResult<Vec<CacheEntry>> {
        let owner_c = owner.clone();
        self.run(owner, collection, move |conn, limits, now| {
            prune_expired(conn, &owner_c, collection, limits, now)?;
            select_entries(
                conn,
                "WHERE owner = ?1 AND collection = ?2 AND synced = 0 \
                 ORDER BY captured_at ASC, rowid ASC",
                params![owner_c.as_str(), collection.as_str()],
            )
        })
        .await
    }

    /// Flags an entry as confirmed. Returns false if it is not cached.
    pub async fn mark_synced(
        &self,
        collection: Collection,
        owner: &AccountId,
        id: &EntityId,
    ) -> CacheResult<bool> {
        let (owner_c, id) = (owner.clone(), id.clone());
        self.run(owner, collection, move |conn, _, _| {
            let changed = conn.execute(
                "UPDATE cache_entries SET synced = 1 \
                 WHERE owner = ?1 AND collection = ?2 AND entity_id = ?3",
                params![owner_c.as_str(), collection.as_str(), id.as_str()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Deletes an entry. Returns false if it was not cached.
    pub async fn delete(
        &self,
        collection: Collection,
        owner: &AccountId,
        id: &EntityId,
    ) -> CacheResult<bool> {
        let (owner_c, id) = (owner.clone(), id.clone());
        self.run(owner, collection, move |conn, _, _| {
            delete_row(conn, &owner_c, collection, &id)
        })
        .await
    }

    /// Deletes an entry and returns what was stored, for rollback.
    pub async fn remove(
        &self,
        collection: Collection,
        owner: &AccountId,
        id: &EntityId,
    ) -> CacheResult<Option<CacheEntry>> {
        let (owner_c, id) = (owner.clone(), id.clone());
        self.run(owner, collection, move |conn, limits, now| {
            let tx = conn.transaction()?;
            let before = fetch(&tx, &owner_c, collection, &id)?;
            delete_row(&tx, &owner_c, collection, &id)?;
            tx.commit()?;
            Ok(before.filter(|e| !limits.is_expired(e, now)))
        })
        .await
    }

    /// Merges `patch` into the cached payload (creating the entry if absent)
    /// and marks it unsynced, in one partition turn.
    ///
    /// The new `last_modified` is the current time, but never earlier than
    /// just after the previous value.
    pub async fn apply_patch(
        &self,
        collection: Collection,
        owner: &AccountId,
        id: &EntityId,
        patch: Payload,
    ) -> CacheResult<PatchOutcome> {
        let (owner_c, id) = (owner.clone(), id.clone());
        self.run(owner, collection, move |conn, limits, now| {
            let tx = conn.transaction()?;
            let before = fetch(&tx, &owner_c, collection, &id)?
                .filter(|e| !limits.is_expired(e, now));
            let (payload, last_modified) = match &before {
                Some(prev) => (
                    merged(&prev.payload, &patch),
                    now.max(prev.last_modified.next()),
                ),
                None => (patch, now),
            };
            let after = CacheEntry {
                entity_id: id,
                owner: owner_c,
                collection,
                payload,
                captured_at: now,
                synced: false,
                last_modified,
            };
            upsert(&tx, &after, now)?;
            let evicted = evict(&tx, &after.owner, collection, limits)?;
            tx.commit()?;
            Ok(PatchOutcome {
                before,
                after,
                evicted,
            })
        })
        .await
    }

    /// Adopts the server's copy after a confirmed write and marks it synced.
    /// The server timestamp is authoritative and replaces the local one.
    pub async fn confirm(
        &self,
        collection: Collection,
        owner: &AccountId,
        id: &EntityId,
        payload: Payload,
        last_modified: Timestamp,
    ) -> CacheResult<CacheEntry> {
        let (owner_c, id) = (owner.clone(), id.clone());
        self.run(owner, collection, move |conn, limits, now| {
            let entry = CacheEntry {
                entity_id: id,
                owner: owner_c,
                collection,
                payload,
                captured_at: now,
                synced: true,
                last_modified,
            };
            let tx = conn.transaction()?;
            upsert(&tx, &entry, now)?;
            evict(&tx, &entry.owner, collection, limits)?;
            tx.commit()?;
            Ok(entry)
        })
        .await
    }

    /// Replaces a temporary id with the server-assigned one in a single
    /// transaction. If the real id is already cached with a newer version
    /// (pushed by the server first), that version is kept.
    pub async fn rekey(
        &self,
        collection: Collection,
        owner: &AccountId,
        temp_id: &EntityId,
        real_id: &EntityId,
        payload: Payload,
        last_modified: Timestamp,
    ) -> CacheResult<CacheEntry> {
        let (owner_c, temp_id, real_id) = (owner.clone(), temp_id.clone(), real_id.clone());
        self.run(owner, collection, move |conn, _, now| {
            let tx = conn.transaction()?;
            delete_row(&tx, &owner_c, collection, &temp_id)?;
            let entry = match fetch(&tx, &owner_c, collection, &real_id)? {
                Some(current) if current.last_modified > last_modified => CacheEntry {
                    synced: true,
                    captured_at: now,
                    ..current
                },
                _ => CacheEntry {
                    entity_id: real_id,
                    owner: owner_c,
                    collection,
                    payload,
                    captured_at: now,
                    synced: true,
                    last_modified,
                },
            };
            upsert(&tx, &entry, now)?;
            tx.commit()?;
            debug!("Rekeyed {} -> {} in {}", temp_id, entry.entity_id, collection);
            Ok(entry)
        })
        .await
    }

    // ── Owner-wide operations ────────────────────────────────────

    /// Counts for every partition of `owner`. Expired entries that have not
    /// been pruned yet are not counted.
    pub async fn stats(&self, owner: &AccountId) -> CacheResult<CacheStats> {
        let owner = owner.clone();
        let now = self.clock.now();
        let cutoffs: Vec<(Collection, i64)> = Collection::ALL
            .iter()
            .map(|&c| (c, self.limits(c).cutoff(now)))
            .collect();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT COUNT(*), \
                 COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0), MIN(captured_at) \
                 FROM cache_entries \
                 WHERE owner = ?1 AND collection = ?2 AND captured_at >= ?3",
            )?;

            let mut stats = CacheStats::default();
            for (collection, cutoff) in cutoffs {
                let (total, unsynced, oldest) = stmt.query_row(
                    params![owner.as_str(), collection.as_str(), cutoff],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, Option<i64>>(2)?,
                        ))
                    },
                )?;
                if total == 0 {
                    continue;
                }
                stats.total += total as usize;
                stats.unsynced += unsynced as usize;
                stats.per_collection.insert(collection, total as usize);
                if let Some(oldest) = oldest {
                    let oldest = Timestamp::from_millis(oldest.max(0) as u64);
                    stats.oldest_captured_at = Some(match stats.oldest_captured_at {
                        Some(current) => current.min(oldest),
                        None => oldest,
                    });
                }
            }
            Ok(stats)
        })
        .await
    }

    /// Deletes every entry of `owner`. Returns the number removed.
    pub async fn clear_owner(&self, owner: &AccountId) -> CacheResult<usize> {
        let owner = owner.clone();
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM cache_entries WHERE owner = ?1",
                params![owner.as_str()],
            )?;
            info!("Cleared {} cache entries for {}", removed, owner);
            Ok(removed)
        })
        .await
    }

    // ── Plumbing ─────────────────────────────────────────────────

    fn queue(&self, owner: &AccountId, collection: Collection) -> Arc<AsyncMutex<()>> {
        let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
        queues
            .entry((owner.clone(), collection))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn limits(&self, collection: Collection) -> Limits {
        Limits {
            max_age: self.config.max_age(collection),
            max_entries: self.config.max_entries(collection),
        }
    }

    /// Runs `op` in the partition's turn on the blocking pool.
    async fn run<T, F>(&self, owner: &AccountId, collection: Collection, op: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, Limits, Timestamp) -> CacheResult<T> + Send + 'static,
    {
        let queue = self.queue(owner, collection);
        let _turn = queue.lock().await;
        let now = self.clock.now();
        let limits = self.limits(collection);
        self.blocking(move |conn| op(conn, limits, now)).await
    }

    async fn blocking<T, F>(&self, op: F) -> CacheResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> CacheResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            op(&mut conn)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))?
    }
}

fn initialize_schema(conn: &Connection) -> CacheResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cache_entries (
            owner TEXT NOT NULL,
            collection TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            captured_at INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (owner, collection, entity_id)
        );

        CREATE INDEX IF NOT EXISTS idx_cache_owner_captured
            ON cache_entries (owner, collection, captured_at);
        ",
    )?;
    Ok(())
}

struct RawEntry {
    entity_id: String,
    owner: String,
    collection: String,
    payload: String,
    captured_at: i64,
    last_modified: i64,
    synced: bool,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            owner: row.get(1)?,
            collection: row.get(2)?,
            payload: row.get(3)?,
            captured_at: row.get(4)?,
            last_modified: row.get(5)?,
            synced: row.get(6)?,
        })
    }

    fn into_entry(self) -> CacheResult<CacheEntry> {
        let collection: Collection = self
            .collection
            .parse()
            .map_err(|e: tandem_types::Error| CacheError::InvalidData(e.to_string()))?;
        let payload: Payload = serde_json::from_str(&self.payload)?;
        Ok(CacheEntry {
            entity_id: EntityId::new(self.entity_id),
            owner: AccountId::new(self.owner),
            collection,
            payload,
            captured_at: Timestamp::from_millis(self.captured_at.max(0) as u64),
            synced: self.synced,
            last_modified: Timestamp::from_millis(self.last_modified.max(0) as u64),
        })
    }
}

fn fetch(
    conn: &Connection,
    owner: &AccountId,
    collection: Collection,
    id: &EntityId,
) -> CacheResult<Option<CacheEntry>> {
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM cache_entries \
         WHERE owner = ?1 AND collection = ?2 AND entity_id = ?3"
    );
    conn.query_row(
        &sql,
        params![owner.as_str(), collection.as_str(), id.as_str()],
        RawEntry::from_row,
    )
    .optional()?
    .map(RawEntry::into_entry)
    .transpose()
}

fn select_entries<P: Params>(conn: &Connection, clause: &str, params: P) -> CacheResult<Vec<CacheEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM cache_entries {clause}");
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params, RawEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawEntry::into_entry).collect()
}

fn upsert(conn: &Connection, entry: &CacheEntry, captured_at: Timestamp) -> CacheResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO cache_entries \
         (owner, collection, entity_id, payload, captured_at, last_modified, synced) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.owner.as_str(),
            entry.collection.as_str(),
            entry.entity_id.as_str(),
            serde_json::to_string(&entry.payload)?,
            captured_at.as_millis() as i64,
            entry.last_modified.as_millis() as i64,
            entry.synced,
        ],
    )?;
    Ok(())
}

fn delete_row(
    conn: &Connection,
    owner: &AccountId,
    collection: Collection,
    id: &EntityId,
) -> CacheResult<bool> {
    let removed = conn.execute(
        "DELETE FROM cache_entries WHERE owner = ?1 AND collection = ?2 AND entity_id = ?3",
        params![owner.as_str(), collection.as_str(), id.as_str()],
    )?;
    Ok(removed > 0)
}

fn prune_expired(
    conn: &Connection,
    owner: &AccountId,
    collection: Collection,
    limits: Limits,
    now: Timestamp,
) -> CacheResult<usize> {
    let pruned = conn.execute(
        "DELETE FROM cache_entries WHERE owner = ?1 AND collection = ?2 AND captured_at < ?3",
        params![owner.as_str(), collection.as_str(), limits.cutoff(now)],
    )?;
    if pruned > 0 {
        debug!("Pruned {} expired entries from {}/{}", pruned, owner, collection);
    }
    Ok(pruned)
}

/// Drops the oldest captures until the partition is back at its cap.
fn evict(
    conn: &Connection,
    owner: &AccountId,
    collection: Collection,
    limits: Limits,
) -> CacheResult<Vec<EntityId>> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE owner = ?1 AND collection = ?2",
        params![owner.as_str(), collection.as_str()],
        |row| row.get(0),
    )?;
    let excess = count - limits.max_entries as i64;
    if excess <= 0 {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT entity_id FROM cache_entries WHERE owner = ?1 AND collection = ?2 \
         ORDER BY captured_at ASC, rowid ASC LIMIT ?3",
    )?;
    let victims = stmt
        .query_map(params![owner.as_str(), collection.as_str(), excess], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut evicted = Vec::with_capacity(victims.len());
    for id in victims {
        let id = EntityId::new(id);
        delete_row(conn, owner, collection, &id)?;
        evicted.push(id);
    }
    debug!("Evicted {} entries from {}/{}", evicted.len(), owner, collection);
    Ok(evicted)
}
