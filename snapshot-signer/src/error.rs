/// Error type definitions
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Signing failed: {0}")]
    SigningError(String),

    #[error("Verification failed: {0}")]
    VerificationError(String),

    #[error("Invalid key material: {0}")]
    KeyError(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

pub type Result<T> = std::result::Result<T, SignerError>;
