use serde_json::{Map, Value};

/// Schema-less entity payload.
pub type Payload = Map<String, Value>;

/// Shallow-merges `patch` into `base`: every top-level key in the patch
/// overwrites the base value, keys absent from the patch are kept.
///
/// Applying the same patch twice leaves `base` unchanged the second time.
pub fn merge_patch(base: &mut Payload, patch: &Payload) {
    for (key, value) in patch {
        base.insert(key.clone(), value.clone());
    }
}

/// Non-mutating form of [`merge_patch`].
#[must_use]
pub fn merged(base: &Payload, patch: &Payload) -> Payload {
    let mut out = base.clone();
    merge_patch(&mut out, patch);
    out
}
