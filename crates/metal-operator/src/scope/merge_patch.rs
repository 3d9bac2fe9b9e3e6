//! Generation of JSON merge patches ([RFC 7386]).
//!
//! [RFC 7386]: https://datatracker.ietf.org/doc/html/rfc7386

use serde_json::{Map, Value};

/// Computes the merge patch turning `original` into `modified`.
///
/// Returns [`None`] if both documents are equal. Objects are diffed key by key, removed keys
/// become `null`. Everything else, arrays included, is replaced as a whole.
pub fn diff(original: &Value, modified: &Value) -> Option<Value> {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            diff_objects(original, modified).map(Value::Object)
        }
        _ if original == modified => None,
        _ => Some(modified.clone()),
    }
}

fn diff_objects(
    original: &Map<String, Value>,
    modified: &Map<String, Value>,
) -> Option<Map<String, Value>> {
    let mut patch = Map::new();

    for key in original.keys().filter(|key| !modified.contains_key(*key)) {
        patch.insert(key.clone(), Value::Null);
    }

    for (key, value) in modified {
        let change = match original.get(key) {
            Some(previous) => diff(previous, value),
            None => Some(value.clone()),
        };
        if let Some(change) = change {
            patch.insert(key.clone(), change);
        }
    }

    (!patch.is_empty()).then_some(patch)
}
