//! Snapshot signature library
//!
//! Detached signatures over audit snapshot ids. Two schemes are provided:
//! Dilithium3 (post-quantum, asymmetric) and HMAC-SHA256 (keyed hash).
//!
//! # Quick Start
//!
//! ```rust
//! use snapshot_signer::{Dilithium3Signer, Signer};
//!
//! let signer = Dilithium3Signer::generate();
//! let signature = signer.sign(b"snapshot-id").unwrap();
//! assert!(signer.verify(b"snapshot-id", &signature).unwrap());
//! ```

pub mod dilithium;
pub mod error;
pub mod keyed;
pub mod traits;

// Re-export commonly used types
pub use dilithium::Dilithium3Signer;
pub use error::{Result, SignerError};
pub use keyed::HmacSha256Signer;
pub use traits::{SignatureAlgorithm, Signer};

/// Build a verification-only signer for a peer's snapshot
///
/// Asymmetric schemes need `public_key`; HMAC needs the shared `key`.
pub fn verifier_for(
    algorithm: SignatureAlgorithm,
    public_key: Option<&[u8]>,
    shared_key: Option<&[u8]>,
) -> Result<Box<dyn Signer>> {
    match algorithm {
        SignatureAlgorithm::Dilithium3 => {
            let pk = public_key.ok_or_else(|| {
                SignerError::KeyError("Dilithium3 verification requires a public key".to_string())
            })?;
            Ok(Box::new(Dilithium3Signer::verifier(pk)?))
        }
        SignatureAlgorithm::HmacSha256 => {
            let key = shared_key.ok_or_else(|| {
                SignerError::KeyError("HMAC verification requires the shared key".to_string())
            })?;
            Ok(Box::new(HmacSha256Signer::new(key)?))
        }
    }
}
