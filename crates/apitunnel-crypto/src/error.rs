//! Crypto error types.

/// Errors from PSK and certificate operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Pre-shared key must not be empty")]
    EmptyKey,

    #[error("Proof derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Certificate generation error: {0}")]
    CertGeneration(String),
}
