mod common;

use common::{HeldRemote, account, events_until, fast_config, next_event, payload, wait_until};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tandem_remote::RemoteError;
use tandem_remote::memory::MemoryRemote;
use tandem_sync::{ConflictPolicy, ResyncSummary, SyncConfig, SyncError, SyncOrchestrator};
use tandem_types::{CacheEntry, ChangeKind, Collection, EntityId, EventOrigin, Payload};

async fn started(remote: &MemoryRemote) -> SyncOrchestrator {
    common::init_tracing();
    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), fast_config());
    engine.initialize(account()).await.unwrap();
    engine
}

async fn wait_connected(engine: &SyncOrchestrator) {
    tokio::time::timeout(common::WAIT, async {
        while !engine.status().await.unwrap().connected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("channels never connected");
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn operations_need_a_session() {
    let engine = SyncOrchestrator::new(Arc::new(MemoryRemote::new()), SyncConfig::default());
    assert!(!engine.is_initialized());
    assert_eq!(
        engine.subscribe(Collection::Activity).await.unwrap_err(),
        SyncError::NotInitialized
    );
    assert_eq!(engine.status().await.unwrap_err(), SyncError::NotInitialized);
    assert_eq!(
        engine.force_resync().await.unwrap_err(),
        SyncError::NotInitialized
    );
    assert_eq!(
        engine
            .create(Collection::Activity, payload(json!({})))
            .await
            .unwrap_err(),
        SyncError::NotInitialized
    );
}

#[tokio::test]
async fn initialize_twice_is_rejected() {
    let remote = MemoryRemote::new();
    let mut engine = started(&remote).await;
    assert_eq!(engine.account(), Some(&account()));
    assert_eq!(
        engine.initialize(account()).await.unwrap_err(),
        SyncError::AlreadyInitialized
    );
}

#[tokio::test]
async fn teardown_ends_subscriptions_and_closes_feeds() {
    let remote = MemoryRemote::new();
    let mut engine = started(&remote).await;
    wait_connected(&engine).await;
    assert_eq!(remote.feed_count(), 2);
    let mut sub = engine.subscribe(Collection::Activity).await.unwrap();

    engine.teardown().await.unwrap();
    assert!(!engine.is_initialized());
    assert_eq!(sub.next().await, None);
    wait_until(|| remote.feed_count() == 0).await;
    assert_eq!(
        engine.teardown().await.unwrap_err(),
        SyncError::NotInitialized
    );

    engine.initialize(account()).await.unwrap();
    assert!(engine.is_initialized());
}

#[tokio::test]
async fn unusable_cache_path_falls_back_to_memory() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"x").unwrap();

    let mut config = fast_config();
    config.cache.path = Some(blocker.join("cache.db"));
    let remote = MemoryRemote::new();
    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), config);
    engine.initialize(account()).await.unwrap();

    let created = engine
        .create(Collection::Activity, payload(json!({"title": "still works"})))
        .await
        .unwrap();
    let receipt = created.wait().await.unwrap();
    let entry = engine
        .get(Collection::Activity, &receipt.entity_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.payload, payload(json!({"title": "still works"})));
}

#[tokio::test]
async fn cache_survives_sessions_and_wipe_clears_it() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.cache.path = Some(dir.path().join("cache.db"));
    let remote = MemoryRemote::new();

    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), config.clone());
    engine.initialize(account()).await.unwrap();
    let receipt = engine
        .create(Collection::Rule, payload(json!({"name": "focus"})))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    engine.teardown().await.unwrap();

    remote.set_reachable(false);
    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), config);
    engine.initialize(account()).await.unwrap();
    let listed = engine.list(Collection::Rule).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].entity_id, receipt.entity_id);

    let mut sub = engine.subscribe(Collection::Rule).await.unwrap();
    let replayed = next_event(&mut sub).await;
    assert_eq!(replayed.origin, EventOrigin::Cache);
    assert_eq!(replayed.kind, ChangeKind::Added);

    assert_eq!(engine.teardown_and_wipe().await.unwrap(), 1);
    assert!(!engine.is_initialized());
}

// ── Merged event stream ──────────────────────────────────────────

#[tokio::test]
async fn create_shows_locally_then_confirms() {
    let remote = MemoryRemote::new();
    let engine = started(&remote).await;
    let mut sub = engine.subscribe(Collection::Activity).await.unwrap();

    let created = engine
        .create(Collection::Activity, payload(json!({"title": "run"})))
        .await
        .unwrap();
    let temp = created.temp_id.clone();
    let local = next_event(&mut sub).await;
    assert_eq!(local.entity_id, temp);
    assert_eq!(local.origin, EventOrigin::Local);
    assert_eq!(local.kind, ChangeKind::Added);

    let receipt = created.wait().await.unwrap();
    let seen = events_until(&mut sub, |e| {
        e.entity_id == receipt.entity_id && e.origin == EventOrigin::Server
    })
    .await;
    assert!(seen.iter().all(|e| e.collection == Collection::Activity));

    let by_temp = engine.get(Collection::Activity, &temp).await.unwrap().unwrap();
    assert_eq!(by_temp.entity_id, receipt.entity_id);
    assert!(by_temp.synced);
    assert_eq!(engine.list(Collection::Activity).await.unwrap().len(), 1);
}

#[tokio::test]
async fn server_changes_reach_subscribers_of_that_collection_only() {
    let remote = MemoryRemote::new();
    let engine = started(&remote).await;
    let mut activities = engine.subscribe(Collection::Activity).await.unwrap();
    let mut rules = engine.subscribe(Collection::Rule).await.unwrap();
    wait_connected(&engine).await;

    remote.server_put(&account(), Collection::Rule, &EntityId::new("r1"), payload(json!({"on": true})));
    let event = next_event(&mut rules).await;
    assert_eq!(event.entity_id, EntityId::new("r1"));
    assert_eq!(event.origin, EventOrigin::Server);
    assert!(activities.try_next().is_none());

    let cached = engine.get(Collection::Rule, &EntityId::new("r1")).await.unwrap().unwrap();
    assert!(cached.synced);

    remote.server_delete(&account(), Collection::Rule, &EntityId::new("r1"));
    let removed = next_event(&mut rules).await;
    assert_eq!(removed.kind, ChangeKind::Removed);
    assert!(engine.get(Collection::Rule, &EntityId::new("r1")).await.unwrap().is_none());
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let remote = MemoryRemote::new();
    let engine = started(&remote).await;
    let mut sub = engine.subscribe(Collection::Activity).await.unwrap();
    assert!(engine.unsubscribe(sub.id()).await.unwrap());
    assert!(!engine.unsubscribe(sub.id()).await.unwrap());

    engine
        .create(Collection::Activity, payload(json!({})))
        .await
        .unwrap();
    assert_eq!(sub.next().await, None);
}

#[tokio::test]
async fn racing_server_copy_never_overwrites_pending_write() {
    common::init_tracing();
    let memory = MemoryRemote::new();
    let remote = HeldRemote::new(memory.clone());
    memory.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({"title": "v1"})));

    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), fast_config());
    engine.initialize(account()).await.unwrap();
    let mut sub = engine.subscribe(Collection::Activity).await.unwrap();
    events_until(&mut sub, |e| e.entity_id == EntityId::new("a")).await;

    let handle = engine
        .update(Collection::Activity, &EntityId::new("a"), payload(json!({"title": "mine"})), None)
        .await
        .unwrap();
    wait_until(|| remote.waiting() == 1).await;

    memory.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({"title": "theirs"})));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let during = engine.get(Collection::Activity, &EntityId::new("a")).await.unwrap().unwrap();
    assert_eq!(during.payload, payload(json!({"title": "mine"})));
    assert!(!during.synced);

    remote.release(1);
    let receipt = handle.wait().await.unwrap();
    let seen = events_until(&mut sub, |e| {
        e.origin == EventOrigin::Server && e.timestamp == receipt.last_modified
    })
    .await;
    assert!(seen.iter().all(|e| e.payload.get("title") != Some(&json!("theirs"))));

    let settled = engine.get(Collection::Activity, &EntityId::new("a")).await.unwrap().unwrap();
    assert_eq!(settled.payload, payload(json!({"title": "mine"})));
    assert!(settled.synced);
}

#[tokio::test]
async fn create_pushed_before_its_ack_is_cached_once() {
    common::init_tracing();
    let memory = MemoryRemote::new();
    let remote = HeldRemote::acking_late(memory.clone());
    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), fast_config());
    engine.initialize(account()).await.unwrap();
    let mut sub = engine.subscribe(Collection::Activity).await.unwrap();
    wait_connected(&engine).await;

    let created = engine
        .create(Collection::Activity, payload(json!({"title": "x"})))
        .await
        .unwrap();
    let temp = created.temp_id.clone();
    wait_until(|| remote.waiting() == 1).await;
    let real = memory.records(&account(), Collection::Activity)[0].id.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let during = engine.list(Collection::Activity).await.unwrap();
    assert_eq!(during.len(), 1);
    assert_eq!(during[0].entity_id, temp);

    remote.release(1);
    assert_eq!(created.wait().await.unwrap().entity_id, real);
    let mut seen = events_until(&mut sub, |e| e.entity_id == real).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    while let Some(event) = sub.try_next() {
        seen.push(event);
    }
    assert_eq!(seen.iter().filter(|e| e.entity_id == real).count(), 1);

    let settled = engine.list(Collection::Activity).await.unwrap();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].entity_id, real);
    assert!(settled[0].synced);
}

#[tokio::test]
async fn rollback_restores_and_publishes() {
    let remote = MemoryRemote::new();
    remote.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({"title": "v1"})));
    let engine = started(&remote).await;
    let mut sub = engine.subscribe(Collection::Activity).await.unwrap();
    events_until(&mut sub, |e| e.entity_id == EntityId::new("a")).await;

    remote.inject_failures([RemoteError::InvalidRequest("nope".into())]);
    let handle = engine
        .update(Collection::Activity, &EntityId::new("a"), payload(json!({"title": "v2"})), None)
        .await
        .unwrap();
    let op = handle.operation_id();
    assert!(handle.wait().await.is_err());
    assert_eq!(engine.failed_operations().unwrap(), vec![op]);

    engine.rollback(op).await.unwrap();
    let restored = events_until(&mut sub, |e| {
        e.origin == EventOrigin::Local && e.payload.get("title") == Some(&json!("v1"))
    })
    .await;
    assert_eq!(restored.last().map(|e| e.kind), Some(ChangeKind::Modified));
    let entry = engine.get(Collection::Activity, &EntityId::new("a")).await.unwrap().unwrap();
    assert_eq!(entry.payload, payload(json!({"title": "v1"})));
    assert!(entry.synced);
}

// ── Offline & resync ─────────────────────────────────────────────

#[tokio::test]
async fn offline_writes_replay_in_creation_order() {
    let remote = MemoryRemote::new();
    let engine = started(&remote).await;
    wait_connected(&engine).await;

    remote.set_reachable(false);
    engine.set_online(false);
    let first = engine
        .create(Collection::Activity, payload(json!({"title": "first"})))
        .await
        .unwrap();
    let second = engine
        .create(Collection::Activity, payload(json!({"title": "second"})))
        .await
        .unwrap();

    let status = engine.status().await.unwrap();
    assert!(!status.connected);
    assert_eq!(status.pending_operation_count, 2);
    assert_eq!(status.unsynced_cache_count, 2);

    remote.set_reachable(true);
    engine.set_online(true);
    first.wait().await.unwrap();
    second.wait().await.unwrap();

    let status = engine.status().await.unwrap();
    assert_eq!(status.pending_operation_count, 0);
    assert_eq!(status.unsynced_cache_count, 0);

    let titles: Vec<_> = remote
        .write_log()
        .into_iter()
        .map(|entry| match entry.write {
            tandem_remote::RemoteWrite::Create { payload, .. } => payload["title"].clone(),
            other => panic!("unexpected write {other:?}"),
        })
        .collect();
    assert_eq!(titles, vec![json!("first"), json!("second")]);
    assert_eq!(remote.batch_count(), 1);

    tokio::time::timeout(common::WAIT, async {
        while engine.status().await.unwrap().last_full_sync_at.is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("outbox flush never reported");
}

#[tokio::test]
async fn force_resync_replays_unsynced_entries() {
    let remote = MemoryRemote::new();
    let engine = started(&remote).await;
    remote.inject_failures([RemoteError::InvalidRequest("try later".into())]);

    let created = engine
        .create(Collection::Activity, payload(json!({"title": "draft"})))
        .await
        .unwrap();
    assert!(created.wait().await.is_err());
    assert_eq!(engine.status().await.unwrap().unsynced_cache_count, 1);
    assert!(engine.status().await.unwrap().last_full_sync_at.is_none());

    let summary = engine.force_resync().await.unwrap();
    assert_eq!(
        summary,
        ResyncSummary {
            replayed: 1,
            confirmed: 1,
            failed: 0
        }
    );
    let status = engine.status().await.unwrap();
    assert_eq!(status.unsynced_cache_count, 0);
    assert!(status.last_full_sync_at.is_some());
    assert!(engine.failed_operations().unwrap().is_empty());
    assert_eq!(remote.records(&account(), Collection::Activity).len(), 1);
}

/// Fails an update while another device changes the record, then resyncs.
async fn replay_after_server_change(policy: ConflictPolicy) -> (ResyncSummary, Payload, CacheEntry) {
    common::init_tracing();
    let remote = MemoryRemote::new();
    let id = EntityId::new("r1");
    remote.server_put(&account(), Collection::Activity, &id, payload(json!({"a": 1, "b": 1})));
    let mut config = fast_config();
    config.mutation.conflict_policy = policy;
    let mut engine = SyncOrchestrator::new(Arc::new(remote.clone()), config);
    engine.initialize(account()).await.unwrap();
    let mut sub = engine.subscribe(Collection::Activity).await.unwrap();
    events_until(&mut sub, |e| e.entity_id == id).await;
    let snapshot = engine.get(Collection::Activity, &id).await.unwrap();

    remote.set_reachable(false);
    remote.server_put(&account(), Collection::Activity, &id, payload(json!({"a": 1, "b": 99})));
    tokio::time::sleep(Duration::from_millis(5)).await;
    let handle = engine
        .update(Collection::Activity, &id, payload(json!({"a": 2})), snapshot)
        .await
        .unwrap();
    assert!(handle.wait().await.is_err());
    remote.set_reachable(true);

    let summary = engine.force_resync().await.unwrap();
    let server = remote
        .record(&account(), Collection::Activity, &id)
        .unwrap()
        .payload;
    let cached = engine.get(Collection::Activity, &id).await.unwrap().unwrap();
    (summary, server, cached)
}

#[tokio::test]
async fn resync_keeps_newer_server_copy_under_server_wins() {
    let (summary, server, cached) = replay_after_server_change(ConflictPolicy::ServerWins).await;
    assert_eq!(
        summary,
        ResyncSummary {
            replayed: 1,
            confirmed: 1,
            failed: 0
        }
    );
    assert_eq!(server, payload(json!({"a": 1, "b": 99})));
    assert_eq!(cached.payload, server);
    assert!(cached.synced);
}

#[tokio::test]
async fn resync_sends_only_the_failed_patch() {
    let (summary, server, cached) = replay_after_server_change(ConflictPolicy::Merge).await;
    assert_eq!(summary.confirmed, 1);
    assert_eq!(server, payload(json!({"a": 2, "b": 99})));
    assert_eq!(cached.payload, server);
    assert!(cached.synced);
}

#[tokio::test]
async fn resync_reports_conflict_under_fail_policy() {
    let (summary, server, cached) = replay_after_server_change(ConflictPolicy::Fail).await;
    assert_eq!(summary.failed, 1);
    assert_eq!(server, payload(json!({"a": 1, "b": 99})));
    assert!(!cached.synced);
}

#[tokio::test]
async fn revoked_collection_reports_channel_error() {
    let remote = MemoryRemote::new();
    let engine = started(&remote).await;
    let mut errors = engine.channel_errors();
    wait_connected(&engine).await;

    remote.revoke(&account(), Collection::Rule);
    let failure = tokio::time::timeout(common::WAIT, errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failure.collection, Collection::Rule);
    assert!(matches!(failure.error, SyncError::RemoteRejection(_)));
    assert!(!engine.status().await.unwrap().connected);
}
