//! Key-store adapter for the reader authentication keys.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use p256::ecdsa::{Signature, SigningKey};
use signature::Signer;
use uuid::Uuid;

/// Settings for a new key. Keys are always P-256 signing keys.
#[derive(Debug, Clone, Default)]
pub struct CreateKeySettings {
    /// Alias to store the key under; generated when absent.
    pub alias: Option<String>,
}

/// Public information about a key held by a [SecureArea].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub alias: String,
    pub public_key: p256::PublicKey,
}

#[derive(Debug, thiserror::Error)]
pub enum SecureAreaError {
    #[error("no key with alias '{0}'")]
    NoSuchKey(String),
    #[error("a key with alias '{0}' already exists")]
    AliasInUse(String),
    #[error("secure area lock poisoned")]
    Poisoned,
    #[error("signing failed: {0}")]
    Signing(#[from] signature::Error),
    #[error("secure area failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[async_trait]
pub trait SecureArea: Send + Sync {
    async fn create_key(&self, settings: &CreateKeySettings) -> Result<KeyInfo, SecureAreaError>;

    async fn get_key_info(&self, alias: &str) -> Result<KeyInfo, SecureAreaError>;

    /// Deleting an alias that does not exist is not an error.
    async fn delete_key(&self, alias: &str) -> Result<(), SecureAreaError>;

    /// ECDSA over SHA-256 of `data`.
    async fn sign(&self, alias: &str, data: &[u8]) -> Result<Signature, SecureAreaError>;
}

/// A [SecureArea] keeping P-256 keys in process memory.
#[derive(Debug, Default)]
pub struct SoftwareSecureArea {
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl SoftwareSecureArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.keys.lock().map(|keys| keys.len()).unwrap_or_default()
    }

    fn key_info(alias: &str, key: &SigningKey) -> KeyInfo {
        KeyInfo {
            alias: alias.to_owned(),
            public_key: p256::PublicKey::from(key.verifying_key()),
        }
    }
}

#[async_trait]
impl SecureArea for SoftwareSecureArea {
    async fn create_key(&self, settings: &CreateKeySettings) -> Result<KeyInfo, SecureAreaError> {
        let alias = settings
            .alias
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        if keys.contains_key(&alias) {
            return Err(SecureAreaError::AliasInUse(alias));
        }
        let key = SigningKey::random(&mut rand::thread_rng());
        let info = Self::key_info(&alias, &key);
        keys.insert(alias, key);
        Ok(info)
    }

    async fn get_key_info(&self, alias: &str) -> Result<KeyInfo, SecureAreaError> {
        let keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        keys.get(alias)
            .map(|key| Self::key_info(alias, key))
            .ok_or_else(|| SecureAreaError::NoSuchKey(alias.to_owned()))
    }

    async fn delete_key(&self, alias: &str) -> Result<(), SecureAreaError> {
        let mut keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        keys.remove(alias);
        Ok(())
    }

    async fn sign(&self, alias: &str, data: &[u8]) -> Result<Signature, SecureAreaError> {
        let keys = self.keys.lock().map_err(|_| SecureAreaError::Poisoned)?;
        let key = keys
            .get(alias)
            .ok_or_else(|| SecureAreaError::NoSuchKey(alias.to_owned()))?;
        Ok(key.try_sign(data)?)
    }
}
