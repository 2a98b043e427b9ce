//! Output storage
//!
//! A task (or workflow) result recorded in the event log is either the
//! literal value or a reference to an out-of-band blob. The scheduler treats
//! the two transparently; only the final consumer dereferences.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;

/// A stored result: inline value or an opaque reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum StoredValue {
    Inline {
        value: Value,
    },
    Reference {
        backend: String,
        key: String,
        metadata: Value,
    },
}

impl StoredValue {
    pub fn inline(value: Value) -> Self {
        Self::Inline { value }
    }
}

/// Serializer used by file-backed storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SerializerKind {
    #[default]
    Json,
    Binary,
}

impl std::str::FromStr for SerializerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "binary" => Ok(Self::Binary),
            other => Err(format!("serializer must be 'json' or 'binary', got '{other}'")),
        }
    }
}

/// Byte sink keyed by a logical reference
pub trait OutputStorage: Send + Sync + 'static {
    /// Store a value under the given id, returning what goes into the event
    fn store(&self, id: &str, value: Value) -> Result<StoredValue, EngineError>;

    /// Resolve a stored value back to its literal form
    fn resolve(&self, stored: &StoredValue) -> Result<Value, EngineError>;
}

/// Pass-through storage: the value itself is recorded in the event
#[derive(Debug, Default, Clone)]
pub struct InlineOutputStorage;

impl OutputStorage for InlineOutputStorage {
    fn store(&self, _id: &str, value: Value) -> Result<StoredValue, EngineError> {
        Ok(StoredValue::inline(value))
    }

    fn resolve(&self, stored: &StoredValue) -> Result<Value, EngineError> {
        match stored {
            StoredValue::Inline { value } => Ok(value.clone()),
            StoredValue::Reference { backend, key, .. } => Err(EngineError::OutputStorage(
                format!("inline storage cannot resolve reference {backend}:{key}"),
            )),
        }
    }
}

/// File-backed storage under a base directory
///
/// The event records only `{backend, key, metadata}`; the payload lives in a
/// file named after the owning task id.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    base_path: PathBuf,
    serializer: SerializerKind,
}

impl LocalFileStorage {
    pub const BACKEND: &'static str = "local_file";

    pub fn new(base_path: impl Into<PathBuf>, serializer: SerializerKind) -> Self {
        Self {
            base_path: base_path.into(),
            serializer,
        }
    }

    fn extension(&self) -> &'static str {
        match self.serializer {
            SerializerKind::Json => "json",
            SerializerKind::Binary => "bin",
        }
    }

    fn serialize(&self, value: &Value) -> Result<Vec<u8>, EngineError> {
        match self.serializer {
            SerializerKind::Json => serde_json::to_vec(value).map_err(EngineError::from),
            // Arbitrary JSON values need a self-describing payload, so the
            // binary format frames the serialized text
            SerializerKind::Binary => bincode::serialize(&serde_json::to_string(value)?)
                .map_err(|e| EngineError::OutputStorage(e.to_string())),
        }
    }

    fn deserialize(&self, bytes: &[u8], serializer: SerializerKind) -> Result<Value, EngineError> {
        match serializer {
            SerializerKind::Json => serde_json::from_slice(bytes).map_err(EngineError::from),
            SerializerKind::Binary => {
                let text: String = bincode::deserialize(bytes)
                    .map_err(|e| EngineError::OutputStorage(e.to_string()))?;
                serde_json::from_str(&text).map_err(EngineError::from)
            }
        }
    }
}

/// Keep file names safe regardless of what ends up in a task name
fn sanitize_key(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

impl OutputStorage for LocalFileStorage {
    fn store(&self, id: &str, value: Value) -> Result<StoredValue, EngineError> {
        fs::create_dir_all(&self.base_path)
            .map_err(|e| EngineError::OutputStorage(e.to_string()))?;

        let filename = format!("{}.{}", sanitize_key(id), self.extension());
        let path = self.base_path.join(&filename);
        let bytes = self.serialize(&value)?;
        fs::write(&path, bytes).map_err(|e| EngineError::OutputStorage(e.to_string()))?;

        Ok(StoredValue::Reference {
            backend: Self::BACKEND.to_string(),
            key: filename,
            metadata: serde_json::json!({ "serializer": self.serializer }),
        })
    }

    fn resolve(&self, stored: &StoredValue) -> Result<Value, EngineError> {
        match stored {
            StoredValue::Inline { value } => Ok(value.clone()),
            StoredValue::Reference { backend, key, metadata } => {
                if backend != Self::BACKEND {
                    return Err(EngineError::OutputStorage(format!(
                        "unknown storage backend: {backend}"
                    )));
                }
                let serializer = metadata
                    .get("serializer")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or(self.serializer);
                let path = self.base_path.join(key);
                let bytes =
                    fs::read(&path).map_err(|e| EngineError::OutputStorage(e.to_string()))?;
                self.deserialize(&bytes, serializer)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inline_round_trip() {
        let storage = InlineOutputStorage;
        let stored = storage.store("task_1", json!({"n": 42})).unwrap();
        assert_eq!(stored, StoredValue::inline(json!({"n": 42})));
        assert_eq!(storage.resolve(&stored).unwrap(), json!({"n": 42}));
    }

    #[test]
    fn test_inline_rejects_references() {
        let storage = InlineOutputStorage;
        let stored = StoredValue::Reference {
            backend: "local_file".to_string(),
            key: "x.json".to_string(),
            metadata: json!({}),
        };
        assert!(storage.resolve(&stored).is_err());
    }

    #[test]
    fn test_local_file_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path(), SerializerKind::Json);

        let stored = storage.store("say_hello_abc", json!("Hello, Joe")).unwrap();
        match &stored {
            StoredValue::Reference { backend, key, .. } => {
                assert_eq!(backend, "local_file");
                assert!(key.ends_with(".json"));
            }
            other => panic!("expected reference, got {other:?}"),
        }

        assert_eq!(storage.resolve(&stored).unwrap(), json!("Hello, Joe"));
    }

    #[test]
    fn test_local_file_binary_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalFileStorage::new(dir.path(), SerializerKind::Binary);

        let value = json!({"list": [1, 2, 3], "nested": {"k": "v"}});
        let stored = storage.store("t1", value.clone()).unwrap();
        assert_eq!(storage.resolve(&stored).unwrap(), value);
    }

    #[test]
    fn test_key_sanitization() {
        assert_eq!(sanitize_key("get_stars_a/b:c"), "get_stars_a_b_c");
    }

    #[test]
    fn test_serializer_from_str() {
        assert_eq!("json".parse::<SerializerKind>().unwrap(), SerializerKind::Json);
        assert_eq!("binary".parse::<SerializerKind>().unwrap(), SerializerKind::Binary);
        assert!("pickle".parse::<SerializerKind>().is_err());
    }
}
