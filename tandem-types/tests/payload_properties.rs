//! Property tests for shallow payload merging.
//!
//! The coordinator relies on two properties of `merge_patch`:
//! - Idempotence: applying the same patch twice equals applying it once
//! - Patch precedence: every key in the patch ends up with the patch value

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use serde_json::{Value, json};
use tandem_types::{Payload, merge_patch, merged};

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| json!(n)),
        "[a-z]{0,12}".prop_map(Value::String),
    ]
}

fn payload_strategy() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map("[a-e]{1,2}", value_strategy(), 0..8)
        .prop_map(|m| m.into_iter().collect::<Payload>())
}

proptest! {
    #[test]
    fn merge_is_idempotent(base in payload_strategy(), patch in payload_strategy()) {
        let once = merged(&base, &patch);
        let twice = merged(&once, &patch);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn patch_keys_take_precedence(base in payload_strategy(), patch in payload_strategy()) {
        let out = merged(&base, &patch);
        for (k, v) in &patch {
            prop_assert_eq!(out.get(k), Some(v));
        }
        for (k, v) in &base {
            if !patch.contains_key(k) {
                prop_assert_eq!(out.get(k), Some(v));
            }
        }
    }
}

#[test]
fn ordered_patches_accumulate() {
    let mut payload = Payload::new();
    let a = json!({"a": 1});
    let b = json!({"b": 2});
    merge_patch(&mut payload, a.as_object().unwrap());
    merge_patch(&mut payload, b.as_object().unwrap());
    assert_eq!(Value::Object(payload), json!({"a": 1, "b": 2}));
}

#[test]
fn null_is_stored_not_deleted() {
    let base = json!({"a": 1}).as_object().cloned().unwrap();
    let patch = json!({"a": null}).as_object().cloned().unwrap();
    let out = merged(&base, &patch);
    assert_eq!(out.get("a"), Some(&Value::Null));
}
