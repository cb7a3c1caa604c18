//! Error types for key handling and signature verification.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Byte string is not a valid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Byte string is not a valid secret key
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// Byte string is not a valid signature
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// Signature does not verify under the given key
    #[error("signature verification failed")]
    VerificationFailed,

    /// Hex decoding failed
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}
