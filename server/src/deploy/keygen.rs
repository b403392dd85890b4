//! Deploy key generation and decoding

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

use crate::errors::HostError;

/// Length of a deploy key seed in bytes
pub const SEED_LEN: usize = 32;

/// A freshly generated deploy key
#[derive(Debug, Clone)]
pub struct DeployKeyPair {
    /// Secret seed for the operator, hex encoded
    pub seed_hex: String,

    /// Public key for the server's key file, hex encoded
    pub public_hex: String,
}

/// Generate a deploy key from the OS random number generator
pub fn create_deploy_key() -> DeployKeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    DeployKeyPair {
        seed_hex: hex::encode(signing_key.to_bytes()),
        public_hex: hex::encode(signing_key.verifying_key().to_bytes()),
    }
}

/// Decode a hex seed into a signing key
pub fn signing_key_from_hex(seed_hex: &str) -> Result<SigningKey, HostError> {
    let seed = hex::decode(seed_hex.trim())
        .map_err(|e| HostError::ConfigError(format!("deploy key must be hex encoded: {}", e)))?;
    let seed: [u8; SEED_LEN] = seed.try_into().map_err(|_| {
        HostError::ConfigError(format!("deploy key must have length {}", SEED_LEN * 2))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}
