//! Configuration
//!
//! Loaded from `reflow.toml` (if present) and then overridden by
//! `REFLOW_`-prefixed environment variables, nested sections separated by
//! `__` (e.g. `REFLOW_EXECUTOR__MAX_WORKERS=8`).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::output::SerializerKind;

/// Executor settings: worker pool sizing, default task policies, and the
/// advisory resource budget used for admission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Maximum number of concurrently executing tasks (0 = CPU count)
    pub max_workers: usize,

    /// Default per-attempt task timeout in seconds (0 = unbounded)
    pub default_timeout: u64,

    /// Default number of retry attempts for tasks that enable retries
    pub retry_attempts: u32,

    /// Default delay between retries in seconds
    pub retry_delay: u64,

    /// Default backoff multiplier for retries
    pub retry_backoff: f64,

    /// Advisory CPU budget
    pub available_cpu: u32,

    /// Advisory memory budget in GB
    pub available_memory: f64,

    /// Advisory GPU budget
    pub available_gpu: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_workers: 0,
            default_timeout: 0,
            retry_attempts: 3,
            retry_delay: 1,
            retry_backoff: 2.0,
            available_cpu: 4,
            available_memory: 8.0,
            available_gpu: 0,
        }
    }
}

impl ExecutorSettings {
    /// Effective worker pool size
    pub fn effective_max_workers(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Catalog settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CatalogSettings {
    /// Register the built-in demo workflows on startup
    pub auto_register: bool,
}

/// Security settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecuritySettings {
    /// Base64-encoded 32-byte key for the encrypted secret store
    pub encryption_key: Option<String>,
}

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReflowConfig {
    /// Database URL for the durable context store
    pub database_url: String,

    /// HTTP server bind host
    pub server_host: String,

    /// HTTP server port
    pub server_port: u16,

    /// Home directory for engine-owned files (secret store, etc.)
    pub home: String,

    /// Directory for the file cache backend
    pub cache_path: String,

    /// Directory for file-backed output storage
    pub local_storage_path: String,

    /// Default serializer for file-backed output storage
    pub serializer: SerializerKind,

    /// Static bearer token for the HTTP surface (None = accept any token)
    pub api_token: Option<String>,

    pub executor: ExecutorSettings,
    pub catalog: CatalogSettings,
    pub security: SecuritySettings,
}

impl Default for ReflowConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/reflow".to_string(),
            server_host: "127.0.0.1".to_string(),
            server_port: 8000,
            home: ".reflow".to_string(),
            cache_path: ".reflow/cache".to_string(),
            local_storage_path: ".reflow/data".to_string(),
            serializer: SerializerKind::Json,
            api_token: None,
            executor: ExecutorSettings::default(),
            catalog: CatalogSettings::default(),
            security: SecuritySettings::default(),
        }
    }
}

const ENV_PREFIX: &str = "REFLOW_";

impl ReflowConfig {
    /// Load configuration: `reflow.toml` first, environment overrides second
    pub fn load() -> Self {
        let mut config = Self::from_file(Path::new("reflow.toml")).unwrap_or_default();
        config.apply_env();
        config
    }

    /// Parse a TOML config file; `None` when missing or unreadable
    pub fn from_file(path: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config file");
                None
            }
        }
    }

    /// Overlay `REFLOW_*` environment variables
    pub fn apply_env(&mut self) {
        if let Some(v) = env_var("DATABASE_URL") {
            self.database_url = v;
        }
        if let Some(v) = env_var("SERVER_HOST") {
            self.server_host = v;
        }
        if let Some(v) = env_parsed("SERVER_PORT") {
            self.server_port = v;
        }
        if let Some(v) = env_var("HOME") {
            self.home = v;
        }
        if let Some(v) = env_var("CACHE_PATH") {
            self.cache_path = v;
        }
        if let Some(v) = env_var("LOCAL_STORAGE_PATH") {
            self.local_storage_path = v;
        }
        if let Some(v) = env_var("SERIALIZER") {
            match v.parse() {
                Ok(kind) => self.serializer = kind,
                Err(e) => tracing::warn!(error = %e, "ignoring invalid REFLOW_SERIALIZER"),
            }
        }
        if let Some(v) = env_var("API_TOKEN") {
            self.api_token = Some(v);
        }

        if let Some(v) = env_parsed("EXECUTOR__MAX_WORKERS") {
            self.executor.max_workers = v;
        }
        if let Some(v) = env_parsed("EXECUTOR__DEFAULT_TIMEOUT") {
            self.executor.default_timeout = v;
        }
        if let Some(v) = env_parsed("EXECUTOR__RETRY_ATTEMPTS") {
            self.executor.retry_attempts = v;
        }
        if let Some(v) = env_parsed("EXECUTOR__RETRY_DELAY") {
            self.executor.retry_delay = v;
        }
        if let Some(v) = env_parsed("EXECUTOR__RETRY_BACKOFF") {
            self.executor.retry_backoff = v;
        }
        if let Some(v) = env_parsed("EXECUTOR__AVAILABLE_CPU") {
            self.executor.available_cpu = v;
        }
        if let Some(v) = env_parsed("EXECUTOR__AVAILABLE_MEMORY") {
            self.executor.available_memory = v;
        }
        if let Some(v) = env_parsed("EXECUTOR__AVAILABLE_GPU") {
            self.executor.available_gpu = v;
        }

        if let Some(v) = env_parsed("CATALOG__AUTO_REGISTER") {
            self.catalog.auto_register = v;
        }
        if let Some(v) = env_var("SECURITY__ENCRYPTION_KEY") {
            self.security.encryption_key = Some(v);
        }
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{suffix}")).ok()
}

fn env_parsed<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    env_var(suffix).and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ReflowConfig::default();
        assert_eq!(config.server_port, 8000);
        assert_eq!(config.executor.retry_attempts, 3);
        assert_eq!(config.executor.retry_backoff, 2.0);
        assert_eq!(config.serializer, SerializerKind::Json);
        assert!(config.api_token.is_none());
        assert!(config.executor.effective_max_workers() >= 1);
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reflow.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
database_url = "postgres://db:5432/wf"
server_port = 9100
serializer = "binary"

[executor]
max_workers = 8
retry_attempts = 5

[catalog]
auto_register = true
"#
        )
        .unwrap();

        let config = ReflowConfig::from_file(&path).unwrap();
        assert_eq!(config.database_url, "postgres://db:5432/wf");
        assert_eq!(config.server_port, 9100);
        assert_eq!(config.serializer, SerializerKind::Binary);
        assert_eq!(config.executor.max_workers, 8);
        assert_eq!(config.executor.retry_attempts, 5);
        // Unset fields keep their defaults
        assert_eq!(config.executor.retry_delay, 1);
        assert!(config.catalog.auto_register);
    }

    #[test]
    fn test_missing_file_is_none() {
        assert!(ReflowConfig::from_file(Path::new("/nonexistent/reflow.toml")).is_none());
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("REFLOW_SERVER_PORT", "9999");
        std::env::set_var("REFLOW_EXECUTOR__MAX_WORKERS", "2");
        std::env::set_var("REFLOW_CATALOG__AUTO_REGISTER", "true");

        let mut config = ReflowConfig::default();
        config.apply_env();
        assert_eq!(config.server_port, 9999);
        assert_eq!(config.executor.max_workers, 2);
        assert!(config.catalog.auto_register);

        std::env::remove_var("REFLOW_SERVER_PORT");
        std::env::remove_var("REFLOW_EXECUTOR__MAX_WORKERS");
        std::env::remove_var("REFLOW_CATALOG__AUTO_REGISTER");
    }
}
