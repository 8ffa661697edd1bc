//! BankLock Protocol Messages
//!
//! Messages exchanged between worker processes and the lock coordinator over
//! the persistent WebSocket channel, plus the statistics snapshot served by
//! `status-request` and the HTTP surface.

pub mod messages;
pub mod codec;
pub mod stats;

pub use messages::*;
pub use codec::{decode_client_message, decode_server_message, encode, DecodeError};
pub use stats::*;

/// Denial reasons carried in `LOCK_DENIED.razon`.
pub mod reasons {
    /// Advisory denial: the request stays queued and may still be granted.
    pub const QUEUED: &str = "resources occupied, queued";
    /// Retry ceiling reached (capacity backpressure or duplicate retries).
    pub const RETRY_LIMIT: &str = "exceeded retry limit";
    /// Retry ceiling reached while the resources stayed occupied.
    pub const RETRY_LIMIT_OCCUPIED: &str = "exceeded retry limit due to occupied resources";
    /// Request chosen as victim of a wait-for cycle.
    pub const DEADLOCK_VICTIM: &str = "cancelled to resolve deadlock";
    /// Request withdrawn with `CANCEL_REQUEST`.
    pub const CANCELLED: &str = "cancelled by worker";

    /// Whether a denial leaves the request waiting in the queue.
    pub fn is_advisory(reason: &str) -> bool {
        reason == QUEUED
    }
}

/// Authentication error texts carried in `auth-error.error`.
pub mod auth_errors {
    pub const INVALID_TOKEN: &str = "invalid or missing token";
    pub const NOT_AUTHENTICATED: &str = "worker not authenticated";
}
