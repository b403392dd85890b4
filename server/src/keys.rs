//! Deploy credentials: API keys identify a user, deploy keys verify what the user ships

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::HostError;
use crate::filesys::file::File;

/// Source of deploy credentials
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Resolve an API key to a user id, `None` if the key is unknown
    async fn authenticate(&self, api_key: &str) -> Result<Option<String>, HostError>;

    /// Public keys the user may sign packages with. Revoked keys are excluded.
    async fn deploy_keys(&self, user_id: &str) -> Result<Vec<VerifyingKey>, HostError>;
}

/// Contents of the key file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFile {
    #[serde(default)]
    pub users: Vec<UserKeys>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserKeys {
    pub id: String,

    #[serde(default)]
    pub api_keys: Vec<String>,

    /// Hex encoded Ed25519 public keys
    #[serde(default)]
    pub deploy_keys: Vec<String>,

    #[serde(default)]
    pub revoked_deploy_keys: Vec<String>,
}

impl UserKeys {
    /// Decode the usable deploy keys, skipping malformed and revoked entries
    pub fn verifying_keys(&self) -> Vec<VerifyingKey> {
        self.deploy_keys
            .iter()
            .filter(|key| {
                !self
                    .revoked_deploy_keys
                    .iter()
                    .any(|revoked| revoked.eq_ignore_ascii_case(key))
            })
            .filter_map(|key| match decode_public_key(key) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!("Skipping deploy key for user {}: {}", self.id, e);
                    None
                }
            })
            .collect()
    }
}

/// Parse a hex encoded Ed25519 public key
pub fn decode_public_key(hex_key: &str) -> Result<VerifyingKey, HostError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| HostError::ConfigError(format!("invalid public key hex: {}", e)))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
        HostError::ConfigError(format!("public key must be 32 bytes, got {}", b.len()))
    })?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| HostError::ConfigError(format!("invalid public key: {}", e)))
}

/// Key store backed by a JSON file
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
    keys: Arc<RwLock<KeyFile>>,
}

impl FileKeyStore {
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, HostError> {
        let store = Self {
            path: path.into(),
            keys: Arc::new(RwLock::new(KeyFile::default())),
        };
        store.reload().await?;
        Ok(store)
    }

    /// Build a store from an in-memory key file
    pub fn from_keys(keys: KeyFile) -> Self {
        Self {
            path: PathBuf::new(),
            keys: Arc::new(RwLock::new(keys)),
        }
    }

    /// Re-read the key file
    pub async fn reload(&self) -> Result<(), HostError> {
        let keys: KeyFile = File::new(&self.path).read_json().await.map_err(|e| {
            HostError::ConfigError(format!("failed to read key file {}: {}", self.path.display(), e))
        })?;

        info!("Loaded {} users from {}", keys.users.len(), self.path.display());
        *self.keys.write().await = keys;
        Ok(())
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn authenticate(&self, api_key: &str) -> Result<Option<String>, HostError> {
        if api_key.is_empty() {
            return Ok(None);
        }
        let keys = self.keys.read().await;
        Ok(keys
            .users
            .iter()
            .find(|user| user.api_keys.iter().any(|k| k == api_key))
            .map(|user| user.id.clone()))
    }

    async fn deploy_keys(&self, user_id: &str) -> Result<Vec<VerifyingKey>, HostError> {
        let keys = self.keys.read().await;
        Ok(keys
            .users
            .iter()
            .find(|user| user.id == user_id)
            .map(UserKeys::verifying_keys)
            .unwrap_or_default())
    }
}
