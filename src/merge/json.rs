// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Deep merge and canonical form of JSON documents.

use serde_json::{Map, Value};

/// Deep merge new JSON value into old JSON value.
///
/// - Objects present on both sides are merged key by key.
/// - `null` on the new side means "leave alone", so the old value is kept, or
///   the key stays absent if the old side never had it.
/// - Objects missing on the old side are merged into an empty object, which
///   strips nested `null` values the same way.
/// - Arrays and scalars on the new side replace the old value wholesale.
pub fn deep_merge(old: Value, new: Value) -> Value {
    match (old, new) {
        (old, Value::Null) => old,
        (Value::Object(old), Value::Object(new)) => Value::Object(merge_objects(old, new)),
        (_, Value::Object(new)) => Value::Object(merge_objects(Map::new(), new)),
        (_, new) => new,
    }
}

fn merge_objects(mut old: Map<String, Value>, new: Map<String, Value>) -> Map<String, Value> {
    for (key, incoming) in new {
        match incoming {
            Value::Null => continue,
            Value::Object(incoming) => {
                let merged = match old.remove(&key) {
                    Some(Value::Object(existing)) => merge_objects(existing, incoming),
                    _ => merge_objects(Map::new(), incoming),
                };
                old.insert(key, Value::Object(merged));
            }
            incoming => {
                old.insert(key, incoming);
            }
        }
    }

    old
}

/// Serialize JSON value in canonical form.
///
/// Canonical form is UTF-8 text with object keys sorted ascending, two-space
/// indentation, and a trailing newline.
///
/// # Errors
///
/// - Return [`serde_json::Error`] if value cannot be serialized.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec_pretty(&sorted(value))?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys = map.keys().collect::<Vec<_>>();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|key| (key.clone(), sorted(&map[key])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
