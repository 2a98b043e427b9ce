//! Secret management
//!
//! Tasks declare the secrets they need (`secret_requests`); the runtime
//! fetches them just before execution and injects them into the task's
//! kwargs. Secret values never appear in events or in persisted task
//! arguments.

use std::collections::HashMap;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Keyed fetch of opaque secrets
#[async_trait]
pub trait SecretManager: Send + Sync + 'static {
    /// Fetch the named secrets. Fails with `SecretNotFound` on the first
    /// missing name.
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, EngineError>;
}

/// Secrets read from process environment variables
///
/// A request for `github_token` reads `REFLOW_SECRET_GITHUB_TOKEN`.
pub struct EnvSecretManager {
    prefix: String,
}

impl EnvSecretManager {
    pub const DEFAULT_PREFIX: &'static str = "REFLOW_SECRET_";

    pub fn new() -> Self {
        Self {
            prefix: Self::DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.to_uppercase())
    }
}

impl Default for EnvSecretManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretManager for EnvSecretManager {
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, EngineError> {
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let value = std::env::var(self.var_name(name))
                .map_err(|_| EngineError::SecretNotFound(name.clone()))?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

/// Secret value encrypted at rest
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EncryptedSecret {
    /// Base64-encoded nonce
    nonce: String,
    /// Base64-encoded ciphertext (includes auth tag)
    ciphertext: String,
}

/// Secrets stored in an AES-256-GCM encrypted JSON file
///
/// The key comes from configuration (`security.encryption_key`,
/// base64-encoded 32 bytes). Intended for local deployments where no external
/// secret service is available.
pub struct EncryptedFileSecretManager {
    path: PathBuf,
    cipher: Aes256Gcm,
}

impl EncryptedFileSecretManager {
    pub fn new(path: impl Into<PathBuf>, encryption_key: &str) -> Result<Self, EngineError> {
        let key_bytes = BASE64
            .decode(encryption_key)
            .map_err(|e| EngineError::Execution(format!("invalid encryption key: {e}")))?;

        if key_bytes.len() != KEY_SIZE {
            return Err(EngineError::Execution(format!(
                "encryption key must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|e| EngineError::Execution(format!("failed to create cipher: {e}")))?;

        Ok(Self {
            path: path.into(),
            cipher,
        })
    }

    /// Generate a fresh base64 key suitable for configuration
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }

    fn load(&self) -> Result<HashMap<String, EncryptedSecret>, EngineError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let bytes = std::fs::read(&self.path)
            .map_err(|e| EngineError::Execution(format!("failed to read secret file: {e}")))?;
        serde_json::from_slice(&bytes).map_err(EngineError::from)
    }

    fn persist(&self, secrets: &HashMap<String, EncryptedSecret>) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EngineError::Execution(format!("failed to create home dir: {e}")))?;
        }
        let bytes = serde_json::to_vec_pretty(secrets)?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| EngineError::Execution(format!("failed to write secret file: {e}")))
    }

    fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, EngineError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| EngineError::Execution(format!("encryption failed: {e}")))?;

        Ok(EncryptedSecret {
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
        })
    }

    fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, EngineError> {
        let nonce_bytes = BASE64
            .decode(&secret.nonce)
            .map_err(|e| EngineError::Execution(format!("invalid nonce: {e}")))?;
        let ciphertext = BASE64
            .decode(&secret.ciphertext)
            .map_err(|e| EngineError::Execution(format!("invalid ciphertext: {e}")))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| EngineError::Execution(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext)
            .map_err(|e| EngineError::Execution(format!("secret is not valid utf-8: {e}")))
    }

    /// Store one secret, encrypting it at rest
    pub fn put(&self, name: &str, value: &str) -> Result<(), EngineError> {
        let mut secrets = self.load()?;
        secrets.insert(name.to_string(), self.encrypt(value)?);
        self.persist(&secrets)
    }

    /// Remove a secret; missing names are a no-op
    pub fn remove(&self, name: &str) -> Result<(), EngineError> {
        let mut secrets = self.load()?;
        if secrets.remove(name).is_some() {
            self.persist(&secrets)?;
        }
        Ok(())
    }
}

#[async_trait]
impl SecretManager for EncryptedFileSecretManager {
    async fn get(&self, names: &[String]) -> Result<HashMap<String, String>, EngineError> {
        let secrets = self.load()?;
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let encrypted = secrets
                .get(name)
                .ok_or_else(|| EngineError::SecretNotFound(name.clone()))?;
            out.insert(name.clone(), self.decrypt(encrypted)?);
        }
        Ok(out)
    }
}
