//! Dilithium3 detached signatures for audit snapshots
//!
//! Dilithium3 (NIST FIPS 204, security level 3) is the default snapshot
//! signature. Snapshots are kept indefinitely as an audit trail, so the
//! signature has to stay trustworthy for longer than classical schemes are
//! expected to.
//!
//! | Item | Size |
//! |------|------|
//! | Public key | 1,952 bytes |
//! | Signature | ~3,293 bytes |
//!
//! Signatures are detached: a snapshot document carries the signature next
//! to the signed `snapshotId`, never a signed-message envelope.

use crate::error::{Result, SignerError};
use crate::traits::{SignatureAlgorithm, Signer};
use pqcrypto_dilithium::dilithium3;
use pqcrypto_traits::sign::{DetachedSignature, PublicKey, SecretKey};

/// Dilithium3 signer
///
/// # Example
///
/// ```rust
/// use snapshot_signer::dilithium::Dilithium3Signer;
/// use snapshot_signer::traits::Signer;
///
/// let signer = Dilithium3Signer::generate();
/// let signature = signer.sign(b"snapshot-id").unwrap();
///
/// let verifier = Dilithium3Signer::verifier(signer.public_key_bytes()).unwrap();
/// assert!(verifier.verify(b"snapshot-id", &signature).unwrap());
/// ```
#[derive(Clone)]
pub struct Dilithium3Signer {
    public_key: Vec<u8>,
    /// Empty for verification-only instances
    secret_key: Vec<u8>,
}

impl Dilithium3Signer {
    /// Generate a fresh keypair
    pub fn generate() -> Self {
        let (pk, sk) = dilithium3::keypair();

        tracing::info!(
            "Generated Dilithium3 keypair: pk_len={} bytes, sk_len={} bytes",
            pk.as_bytes().len(),
            sk.as_bytes().len()
        );

        Self {
            public_key: pk.as_bytes().to_vec(),
            secret_key: sk.as_bytes().to_vec(),
        }
    }

    /// Restore a keypair from persisted bytes
    ///
    /// # Errors
    /// - `KeyError` if either key has the wrong length or does not parse
    pub fn from_bytes(public_key: &[u8], secret_key: &[u8]) -> Result<Self> {
        parse_public_key(public_key)?;

        if secret_key.len() != dilithium3::secret_key_bytes() {
            return Err(SignerError::KeyError(format!(
                "Invalid secret key length: expected {} bytes, got {}",
                dilithium3::secret_key_bytes(),
                secret_key.len()
            )));
        }
        dilithium3::SecretKey::from_bytes(secret_key)
            .map_err(|e| SignerError::KeyError(format!("Invalid secret key: {:?}", e)))?;

        Ok(Self {
            public_key: public_key.to_vec(),
            secret_key: secret_key.to_vec(),
        })
    }

    /// Verification-only instance built from a peer's public key
    ///
    /// `sign()` on the returned value always fails.
    pub fn verifier(public_key: &[u8]) -> Result<Self> {
        parse_public_key(public_key)?;

        tracing::debug!(
            "Created verification-only Dilithium3Signer: pk_len={} bytes",
            public_key.len()
        );

        Ok(Self {
            public_key: public_key.to_vec(),
            secret_key: Vec::new(),
        })
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public_key
    }

    /// Secret key bytes, for persistence only. Never log these.
    pub fn secret_key_bytes(&self) -> &[u8] {
        &self.secret_key
    }

    pub fn can_sign(&self) -> bool {
        !self.secret_key.is_empty()
    }
}

fn parse_public_key(public_key: &[u8]) -> Result<dilithium3::PublicKey> {
    if public_key.len() != dilithium3::public_key_bytes() {
        return Err(SignerError::KeyError(format!(
            "Invalid public key length: expected {} bytes, got {}",
            dilithium3::public_key_bytes(),
            public_key.len()
        )));
    }

    dilithium3::PublicKey::from_bytes(public_key)
        .map_err(|e| SignerError::KeyError(format!("Invalid public key format: {:?}", e)))
}

impl Signer for Dilithium3Signer {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Dilithium3
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        if !self.can_sign() {
            return Err(SignerError::SigningError(
                "Secret key not available (verification-only signer)".to_string(),
            ));
        }

        let sk = dilithium3::SecretKey::from_bytes(&self.secret_key)
            .map_err(|e| SignerError::SigningError(format!("Failed to parse secret key: {:?}", e)))?;

        let signature = dilithium3::detached_sign(message, &sk);

        tracing::debug!(
            "Signed message: msg_len={} bytes, sig_len={} bytes",
            message.len(),
            signature.as_bytes().len()
        );

        Ok(signature.as_bytes().to_vec())
    }

    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool> {
        let pk = parse_public_key(&self.public_key)
            .map_err(|e| SignerError::VerificationError(e.to_string()))?;

        let signature = match dilithium3::DetachedSignature::from_bytes(signature) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::warn!("Malformed Dilithium3 signature: {:?}", e);
                return Ok(false);
            }
        };

        match dilithium3::verify_detached_signature(&signature, message, &pk) {
            Ok(()) => Ok(true),
            Err(_) => {
                tracing::warn!("Dilithium3 signature verification failed");
                Ok(false)
            }
        }
    }

    fn public_key(&self) -> Option<&[u8]> {
        Some(&self.public_key)
    }
}
