//! Stable task ids
//!
//! A task invocation is identified by `{name}_{hash}` where the hash covers
//! the task name, the positional arguments, and the keyword arguments sorted
//! by key. The hash is computed over a canonical JSON encoding (object keys
//! sorted recursively), so it is stable across processes, machines, and
//! kwarg ordering. Replay correctness rests on this id: the same invocation
//! must always map to the same log entries.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest
const HASH_LEN: usize = 16;

/// Render a JSON value canonically: object keys sorted at every depth,
/// compact separators
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Hash of `(name, args, sorted kwargs)`, first `HASH_LEN` hex chars
pub fn stable_hash(name: &str, args: &[Value], kwargs: &Map<String, Value>) -> String {
    let mut sorted_kwargs: Vec<(&String, &Value)> = kwargs.iter().collect();
    sorted_kwargs.sort_by_key(|(k, _)| k.as_str());

    let payload = Value::Array(vec![
        Value::String(name.to_string()),
        Value::Array(args.to_vec()),
        Value::Array(
            sorted_kwargs
                .into_iter()
                .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                .collect(),
        ),
    ]);

    let digest = Sha256::digest(canonical_json(&payload).as_bytes());
    hex::encode(digest)[..HASH_LEN].to_string()
}

/// The replay/dedup key for one task invocation
pub fn stable_task_id(name: &str, args: &[Value], kwargs: &Map<String, Value>) -> String {
    format!("{name}_{}", stable_hash(name, args, kwargs))
}
