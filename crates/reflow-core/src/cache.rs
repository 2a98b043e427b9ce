//! Task result caching
//!
//! Caches are keyed by the stable task id, so a cache hit is exactly a
//! repeat of the same invocation. Entries carry an optional TTL and an
//! optional version tag; a version mismatch invalidates the entry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One cached task result
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    stored_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

impl CacheEntry {
    fn is_valid(&self, version: Option<&str>) -> bool {
        if self.version.as_deref() != version {
            return false;
        }
        match self.ttl_secs {
            None => true,
            Some(ttl) => {
                let age = Utc::now().signed_duration_since(self.stored_at);
                age.num_seconds() >= 0 && (age.num_seconds() as u64) < ttl
            }
        }
    }
}

/// Cache backend keyed by stable task id
pub trait CacheBackend: Send + Sync + 'static {
    /// Look up a valid entry; expired or version-mismatched entries miss
    fn get(&self, key: &str, version: Option<&str>) -> Option<Value>;

    /// Store a value
    fn set(&self, key: &str, value: &Value, ttl: Option<Duration>, version: Option<&str>);

    /// Drop an entry; missing keys are a no-op
    fn delete(&self, key: &str);
}

/// In-memory cache for tests and single-process runs
#[derive(Default)]
pub struct InMemoryCacheBackend {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl CacheBackend for InMemoryCacheBackend {
    fn get(&self, key: &str, version: Option<&str>) -> Option<Value> {
        let entries = self.entries.read();
        entries
            .get(key)
            .filter(|e| e.is_valid(version))
            .map(|e| e.value.clone())
    }

    fn set(&self, key: &str, value: &Value, ttl: Option<Duration>, version: Option<&str>) {
        self.entries.write().insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                stored_at: Utc::now(),
                ttl_secs: ttl.map(|d| d.as_secs()),
                version: version.map(str::to_string),
            },
        );
    }

    fn delete(&self, key: &str) {
        self.entries.write().remove(key);
    }
}

/// File-backed cache under `cache_path`, one JSON file per key
pub struct FileCacheBackend {
    base_path: PathBuf,
}

impl FileCacheBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.base_path.join(format!("{safe}.json"))
    }
}

impl CacheBackend for FileCacheBackend {
    fn get(&self, key: &str, version: Option<&str>) -> Option<Value> {
        let bytes = std::fs::read(self.path_for(key)).ok()?;
        let entry: CacheEntry = serde_json::from_slice(&bytes).ok()?;
        entry.is_valid(version).then_some(entry.value)
    }

    fn set(&self, key: &str, value: &Value, ttl: Option<Duration>, version: Option<&str>) {
        let entry = CacheEntry {
            value: value.clone(),
            stored_at: Utc::now(),
            ttl_secs: ttl.map(|d| d.as_secs()),
            version: version.map(str::to_string),
        };

        if std::fs::create_dir_all(&self.base_path).is_err() {
            tracing::warn!(path = %self.base_path.display(), "failed to create cache dir");
            return;
        }
        if let Ok(bytes) = serde_json::to_vec(&entry) {
            if let Err(e) = std::fs::write(self.path_for(key), bytes) {
                tracing::warn!(key, error = %e, "failed to write cache entry");
            }
        }
    }

    fn delete(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }
}
