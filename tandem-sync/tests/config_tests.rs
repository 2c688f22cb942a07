use pretty_assertions::assert_eq;
use std::time::Duration;
use tandem_remote::Filter;
use tandem_sync::{ConflictPolicy, RetryPolicy, SyncConfig, SyncError, SyncResult};
use tandem_types::{Collection, OperationId};

#[test]
fn defaults() {
    let config = SyncConfig::default();
    assert_eq!(config.collections, Collection::ALL.to_vec());
    assert_eq!(config.mutation.max_retries, 3);
    assert_eq!(config.mutation.conflict_policy, ConflictPolicy::Merge);
    assert_eq!(config.mutation.retry, RetryPolicy::mutations());
    assert_eq!(config.mutation.alias_ttl(), Duration::from_secs(15 * 60));
    assert_eq!(config.channel.retry, RetryPolicy::reconnect());
    assert!(config.cache.path.is_none());
    assert_eq!(config.filter(Collection::Node), Filter::all());
}

#[test]
fn json_overrides_only_what_it_names() {
    let config = SyncConfig::from_json(
        r#"{
            "mutation": { "conflict_policy": "server-wins", "max_retries": 5 },
            "collections": ["activity", "insight"],
            "cache": { "path": "/tmp/tandem/cache.db", "max_entries": 50 },
            "filters": {
                "insight": { "conditions": [{ "field": "pinned", "equals": true }] }
            }
        }"#,
    )
    .unwrap();

    assert_eq!(config.mutation.conflict_policy, ConflictPolicy::ServerWins);
    assert_eq!(config.mutation.max_retries, 5);
    assert_eq!(config.mutation.retry, RetryPolicy::mutations());
    assert_eq!(config.collections, vec![Collection::Activity, Collection::Insight]);
    assert_eq!(config.cache.max_entries, 50);
    assert_eq!(config.cache.max_age(Collection::Activity), Duration::from_millis(7 * 24 * 3_600_000));
    assert_eq!(config.filter(Collection::Insight), Filter::all().eq("pinned", true));
    assert_eq!(config.filter(Collection::Activity), Filter::all());
}

#[test]
fn conflict_policies_use_kebab_case() {
    for (name, policy) in [
        ("\"server-wins\"", ConflictPolicy::ServerWins),
        ("\"client-wins\"", ConflictPolicy::ClientWins),
        ("\"merge\"", ConflictPolicy::Merge),
        ("\"fail\"", ConflictPolicy::Fail),
    ] {
        assert_eq!(serde_json::from_str::<ConflictPolicy>(name).unwrap(), policy);
    }
}

#[test]
fn bad_json_is_a_config_error() {
    let err = SyncConfig::from_json(r#"{"collections": ["calendar"]}"#).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = SyncConfig::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.json");
    std::fs::write(&path, r#"{"channel": {"retry": {"base_delay_ms": 50}}}"#).unwrap();
    let config = SyncConfig::from_file(&path).unwrap();
    assert_eq!(config.channel.retry.base_delay_ms, 50);
    assert_eq!(config.channel.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
}

// ── Error classification ─────────────────────────────────────────

#[test]
fn remote_errors_split_into_transient_and_rejection() {
    use tandem_remote::RemoteError;

    let limited: SyncError = RemoteError::RateLimited { retry_after_ms: 1500 }.into();
    assert!(limited.is_transient());
    assert_eq!(limited.retry_after(), Some(Duration::from_millis(1500)));

    let timeout: SyncError = RemoteError::Timeout.into();
    assert!(timeout.is_transient());
    assert_eq!(timeout.retry_after(), None);

    let denied: SyncError = RemoteError::PermissionDenied("no".into()).into();
    assert!(!denied.is_transient());
    assert!(matches!(denied, SyncError::RemoteRejection(_)));
}

#[test]
fn only_connectivity_is_transient() {
    let errors: Vec<SyncError> = vec![
        SyncError::CacheIo("disk".into()),
        SyncError::Dependency(OperationId::new()),
        SyncError::NotInitialized,
        SyncError::ChannelClosed,
        SyncError::Config("x".into()),
    ];
    assert!(errors.iter().all(|e| !e.is_transient()));

    let result: SyncResult<()> = Err(SyncError::Connectivity {
        message: "offline".into(),
        retry_after_ms: None,
    });
    assert!(result.unwrap_err().is_transient());
}
