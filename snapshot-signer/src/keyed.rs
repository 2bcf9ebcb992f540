//! HMAC-SHA256 keyed-hash snapshot signatures
//!
//! For deployments where every verifier already shares a secret with the
//! node. Verification needs the same key, so a peer can only check these
//! signatures when the key was distributed out of band.

use crate::error::{Result, SignerError};
use crate::traits::{SignatureAlgorithm, Signer};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Minimum accepted key length in bytes
pub const MIN_KEY_LEN: usize = 32;

/// HMAC-SHA256 signer
#[derive(Clone)]
pub struct HmacSha256Signer {
    key: Vec<u8>,
}

impl HmacSha256Signer {
    /// Wrap an existing shared key
    ///
    /// # Errors
    /// - `KeyError` when the key is shorter than [`MIN_KEY_LEN`]
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() < MIN_KEY_LEN {
            return Err(SignerError::KeyError(format!(
                "HMAC key too short: expected at least {} bytes, got {}",
                MIN_KEY_LEN,
                key.len()
            )));
        }
        Ok(Self { key: key.to_vec() })
    }

    /// Generate a random 32-byte key
    pub fn generate() -> Self {
        let mut key = vec![0u8; MIN_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        tracing::info!("Generated HMAC-SHA256 key: {} bytes", key.len());
        Self { key }
    }

    /// Key bytes, for persistence only
    pub fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| SignerError::KeyError(format!("Invalid HMAC key: {}", e)))
    }
}

impl Signer for HmacSha256Signer {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::HmacSha256
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac().map_err(|e| SignerError::SigningError(e.to_string()))?;
        mac.update(message);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool> {
        let mut mac = self
            .mac()
            .map_err(|e| SignerError::VerificationError(e.to_string()))?;
        mac.update(message);
        // constant-time comparison
        Ok(mac.verify_slice(signature).is_ok())
    }

    fn public_key(&self) -> Option<&[u8]> {
        None
    }
}
