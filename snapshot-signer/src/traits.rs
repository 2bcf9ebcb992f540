/// Unified interface for snapshot signatures
use crate::error::{Result, SignerError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Signature algorithms a node may sign its snapshots with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignatureAlgorithm {
    /// Dilithium3 (NIST FIPS 204 Level 3), asymmetric
    Dilithium3,
    /// HMAC-SHA256 keyed hash, requires a shared secret to verify
    HmacSha256,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Dilithium3 => "DILITHIUM3",
            SignatureAlgorithm::HmacSha256 => "HMAC_SHA256",
        }
    }

    /// Whether a verifier can check signatures with the public key alone
    pub fn is_asymmetric(&self) -> bool {
        matches!(self, SignatureAlgorithm::Dilithium3)
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = SignerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "dilithium3" => Ok(SignatureAlgorithm::Dilithium3),
            "hmac-sha256" => Ok(SignatureAlgorithm::HmacSha256),
            other => Err(SignerError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Signer trait
///
/// Implementations must be shareable across tasks: one signer instance
/// serves every audit cycle of a node.
pub trait Signer: Send + Sync {
    /// Algorithm this signer produces
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Produce a detached signature over `message`
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;

    /// Verify a detached signature
    ///
    /// `Ok(false)` means the signature does not match; `Err` is reserved for
    /// malformed keys or signatures.
    fn verify(&self, message: &[u8], signature: &[u8]) -> Result<bool>;

    /// Public key bytes, `None` for symmetric schemes
    fn public_key(&self) -> Option<&[u8]>;
}
