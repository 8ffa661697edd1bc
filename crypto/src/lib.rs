//! BankLock Cryptographic Primitives
//!
//! HMAC-SHA256 worker tokens and hashing helpers.

pub mod token;
pub mod hash;

pub use token::{generate_secret, IssuedToken, TokenSigner};
pub use hash::{sha256, sha256_hex, fingerprint};

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Malformed token")]
    MalformedToken,

    #[error("Token issued for a different worker")]
    WorkerMismatch,

    #[error("Token expired")]
    Expired,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
