use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::time::Duration;
use tandem_sync::RetryPolicy;

#[test]
fn mutation_schedule_doubles_up_to_cap() {
    let policy = RetryPolicy::mutations();
    let delays: Vec<u128> = (1..=7).map(|n| policy.delay(n).as_millis()).collect();
    assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 8000, 8000]);
}

#[test]
fn reconnect_schedule_caps_at_thirty_seconds() {
    let policy = RetryPolicy::reconnect();
    assert_eq!(policy.delay(1), Duration::from_millis(500));
    assert_eq!(policy.delay(6), Duration::from_millis(16_000));
    assert_eq!(policy.delay(7), Duration::from_millis(30_000));
    assert_eq!(policy.delay(u32::MAX), Duration::from_millis(30_000));
}

#[test]
fn attempt_zero_uses_base_delay() {
    assert_eq!(RetryPolicy::mutations().delay(0), Duration::from_millis(250));
}

#[test]
fn server_hint_raises_the_floor() {
    let policy = RetryPolicy::mutations();
    assert_eq!(
        policy.delay_at_least(1, Some(Duration::from_secs(3))),
        Duration::from_secs(3)
    );
    assert_eq!(
        policy.delay_at_least(3, Some(Duration::from_millis(10))),
        Duration::from_millis(1000)
    );
    assert_eq!(policy.delay_at_least(2, None), Duration::from_millis(500));
}

#[test]
fn partial_json_keeps_defaults() {
    let policy: RetryPolicy = serde_json::from_str(r#"{"base_delay_ms": 100}"#).unwrap();
    assert_eq!(policy.base_delay_ms, 100);
    assert_eq!(policy.multiplier, 2);
    assert_eq!(policy.max_delay_ms, 8_000);
}

proptest! {
    #[test]
    fn delays_never_shrink_and_never_exceed_cap(
        base in 1u64..5_000,
        multiplier in 1u32..5,
        max in 1u64..120_000,
        attempt in 1u32..64,
    ) {
        let policy = RetryPolicy { base_delay_ms: base, multiplier, max_delay_ms: max };
        let now = policy.delay(attempt);
        let next = policy.delay(attempt + 1);
        prop_assert!(now <= next);
        prop_assert!(next <= Duration::from_millis(max));
    }
}
