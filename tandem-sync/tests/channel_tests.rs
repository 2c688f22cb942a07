mod common;

use common::{account, fast_retry, payload};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tandem_remote::memory::MemoryRemote;
use tandem_remote::{Filter, Query};
use tandem_sync::{ChannelConfig, ChannelSink, SyncError, open_channel};
use tandem_types::{ChangeKind, Collection, EntityId, EventOrigin, SyncEvent};
use tokio::sync::mpsc;

struct Collect {
    events: mpsc::UnboundedSender<SyncEvent>,
    errors: mpsc::UnboundedSender<(Collection, SyncError)>,
}

impl ChannelSink for Collect {
    fn on_event(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn on_error(&self, collection: Collection, error: SyncError) {
        let _ = self.errors.send((collection, error));
    }
}

type Receivers = (
    mpsc::UnboundedReceiver<SyncEvent>,
    mpsc::UnboundedReceiver<(Collection, SyncError)>,
);

fn sink() -> (Arc<dyn ChannelSink>, Receivers) {
    let (events, events_rx) = mpsc::unbounded_channel();
    let (errors, errors_rx) = mpsc::unbounded_channel();
    (Arc::new(Collect { events, errors }), (events_rx, errors_rx))
}

fn config() -> ChannelConfig {
    ChannelConfig { retry: fast_retry() }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("sink dropped")
}

// ── Delivery ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn delivers_existing_records_then_live_changes() {
    let remote = MemoryRemote::new();
    remote.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({"n": 1})));

    let (sink, (mut events, _errors)) = sink();
    let handle = open_channel(
        Arc::new(remote.clone()),
        Query::new(account(), Collection::Activity),
        config(),
        sink,
    );

    let first = recv(&mut events).await;
    assert_eq!(first.kind, ChangeKind::Added);
    assert_eq!(first.entity_id, EntityId::new("a"));
    assert_eq!(first.origin, EventOrigin::Server);
    assert!(handle.is_connected());

    remote.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({"n": 2})));
    remote.server_delete(&account(), Collection::Activity, &EntityId::new("a"));

    let modified = recv(&mut events).await;
    assert_eq!(modified.kind, ChangeKind::Modified);
    assert_eq!(modified.payload, payload(json!({"n": 2})));
    let removed = recv(&mut events).await;
    assert_eq!(removed.kind, ChangeKind::Removed);
    assert!(removed.timestamp > modified.timestamp);
}

#[tokio::test(start_paused = true)]
async fn filter_limits_what_is_pushed() {
    let remote = MemoryRemote::new();
    let (sink, (mut events, _errors)) = sink();
    let _handle = open_channel(
        Arc::new(remote.clone()),
        Query::new(account(), Collection::Rule).with_filter(Filter::all().eq("enabled", true)),
        config(),
        sink,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    remote.server_put(&account(), Collection::Rule, &EntityId::new("off"), payload(json!({"enabled": false})));
    remote.server_put(&account(), Collection::Rule, &EntityId::new("on"), payload(json!({"enabled": true})));

    let event = recv(&mut events).await;
    assert_eq!(event.entity_id, EntityId::new("on"));
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn removed_id_is_delivered_again_when_recreated() {
    let remote = MemoryRemote::new();
    let (sink, (mut events, mut errors)) = sink();
    let _handle = open_channel(
        Arc::new(remote.clone()),
        Query::new(account(), Collection::Activity),
        config(),
        sink,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    let id = EntityId::new("a");
    remote.server_put(&account(), Collection::Activity, &id, payload(json!({"n": 1})));
    remote.server_delete(&account(), Collection::Activity, &id);
    assert_eq!(recv(&mut events).await.kind, ChangeKind::Added);
    assert_eq!(recv(&mut events).await.kind, ChangeKind::Removed);

    // A resumed feed must not replay the removal.
    remote.drop_feeds();
    recv(&mut errors).await;
    remote.server_put(&account(), Collection::Activity, &id, payload(json!({"n": 2})));

    let recreated = recv(&mut events).await;
    assert_eq!(recreated.kind, ChangeKind::Added);
    assert_eq!(recreated.payload, payload(json!({"n": 2})));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());
}

// ── Reconnect ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn outage_is_reported_once_and_resumes_without_duplicates() {
    let remote = MemoryRemote::new();
    remote.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({"n": 1})));

    let (sink, (mut events, mut errors)) = sink();
    let handle = open_channel(
        Arc::new(remote.clone()),
        Query::new(account(), Collection::Activity),
        config(),
        sink,
    );
    assert_eq!(recv(&mut events).await.entity_id, EntityId::new("a"));

    remote.set_reachable(false);
    let (collection, error) = recv(&mut errors).await;
    assert_eq!(collection, Collection::Activity);
    assert!(error.is_transient());

    // Several reconnect attempts fail while the outage lasts.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!handle.is_connected());
    remote.server_put(&account(), Collection::Activity, &EntityId::new("b"), payload(json!({"n": 1})));
    remote.set_reachable(true);

    let event = recv(&mut events).await;
    assert_eq!(event.entity_id, EntityId::new("b"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "nothing delivered twice");
    assert!(errors.try_recv().is_err(), "one report per outage");
    assert!(handle.is_connected());
}

#[tokio::test(start_paused = true)]
async fn closed_feed_is_treated_as_transient() {
    let remote = MemoryRemote::new();
    let (sink, (mut events, mut errors)) = sink();
    let handle = open_channel(
        Arc::new(remote.clone()),
        Query::new(account(), Collection::Activity),
        config(),
        sink,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    remote.drop_feeds();
    let (_, error) = recv(&mut errors).await;
    assert!(matches!(error, SyncError::Connectivity { .. }));

    remote.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({})));
    assert_eq!(recv(&mut events).await.entity_id, EntityId::new("a"));
    assert!(!handle.is_stopped());
}

#[tokio::test(start_paused = true)]
async fn permission_loss_stops_the_channel() {
    let remote = MemoryRemote::new();
    let (sink, (_events, mut errors)) = sink();
    let handle = open_channel(
        Arc::new(remote.clone()),
        Query::new(account(), Collection::Insight),
        config(),
        sink,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    remote.revoke(&account(), Collection::Insight);
    let (collection, error) = recv(&mut errors).await;
    assert_eq!(collection, Collection::Insight);
    assert!(matches!(error, SyncError::RemoteRejection(_)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(handle.is_stopped());
    assert!(errors.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn close_stops_delivery() {
    let remote = MemoryRemote::new();
    let (sink, (mut events, _errors)) = sink();
    let handle = open_channel(
        Arc::new(remote.clone()),
        Query::new(account(), Collection::Activity),
        config(),
        sink,
    );
    tokio::time::sleep(Duration::from_millis(10)).await;

    handle.close();
    assert!(handle.is_stopped());
    assert!(!handle.is_connected());
    remote.server_put(&account(), Collection::Activity, &EntityId::new("a"), payload(json!({})));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(events.try_recv().is_err());
}
