//! Error types for BankLock operations.

use crate::{RequestId, WorkerId};
use thiserror::Error;

/// Main error type for BankLock operations.
#[derive(Error, Debug)]
pub enum BankLockError {
    /// Invalid message format or content.
    #[error("Invalid message: {message}")]
    InvalidMessage {
        message: String,
        field: Option<String>,
    },

    /// Registration rejected: missing, forged or expired token.
    #[error("Authentication failed for worker {worker_id}: {reason}")]
    AuthenticationFailed { worker_id: WorkerId, reason: String },

    /// Worker sent a lock message without a valid registration on this connection.
    #[error("Worker not authenticated: {0}")]
    NotAuthenticated(WorkerId),

    /// Worker tried to release a resource held by someone else.
    #[error("Resource {resource} is held by {owner}, not {requester}")]
    NotLockOwner {
        resource: String,
        owner: WorkerId,
        requester: WorkerId,
    },

    /// Lock request permanently denied by the coordinator.
    #[error("Lock denied: {reason}")]
    LockDenied {
        request_id: RequestId,
        reason: String,
    },

    /// Gave up waiting for a grant.
    #[error("Timeout waiting for lock: {operation}")]
    LockTimeout { operation: String },

    /// Coordinator is not accepting requests.
    #[error("Coordinator unavailable, retry after {retry_after_ms}ms")]
    CoordinatorUnavailable { retry_after_ms: u64 },

    /// Network error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Crypto error.
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl BankLockError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BankLockError::CoordinatorUnavailable { .. }
                | BankLockError::NetworkError(_)
                | BankLockError::LockTimeout { .. }
        )
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BankLockError::CoordinatorUnavailable { retry_after_ms } => Some(*retry_after_ms),
            BankLockError::NetworkError(_) => Some(500),
            BankLockError::LockTimeout { .. } => Some(1000),
            _ => None,
        }
    }

    /// Get error code for protocol messages and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            BankLockError::InvalidMessage { .. } => "INVALID_MESSAGE",
            BankLockError::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            BankLockError::NotAuthenticated(_) => "NOT_AUTHENTICATED",
            BankLockError::NotLockOwner { .. } => "NOT_LOCK_OWNER",
            BankLockError::LockDenied { .. } => "LOCK_DENIED",
            BankLockError::LockTimeout { .. } => "LOCK_TIMEOUT",
            BankLockError::CoordinatorUnavailable { .. } => "COORDINATOR_UNAVAILABLE",
            BankLockError::NetworkError(_) => "NETWORK_ERROR",
            BankLockError::Serialization(_) => "SERIALIZATION_ERROR",
            BankLockError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            BankLockError::CryptoError(_) => "CRYPTO_ERROR",
            BankLockError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for BankLock operations.
pub type Result<T> = std::result::Result<T, BankLockError>;
