//! Time utilities and protocol timing constants.

use chrono::{DateTime, Duration, TimeZone, Utc};

/// Protocol timing constants.
pub mod constants {
    use super::Duration;

    /// Default lock duration when the request names no timeout (30 seconds).
    pub fn default_lock_duration() -> Duration {
        Duration::seconds(30)
    }

    /// Maximum lock duration enforced by the coordinator (60 seconds).
    pub fn max_lock_duration() -> Duration {
        Duration::seconds(60)
    }

    /// Worker heartbeat interval (5 seconds).
    pub fn heartbeat_interval() -> Duration {
        Duration::seconds(5)
    }

    /// Worker heartbeat timeout (15 seconds).
    pub fn heartbeat_timeout() -> Duration {
        Duration::seconds(15)
    }

    /// Maintenance sweep interval (5 seconds).
    pub fn maintenance_interval() -> Duration {
        Duration::seconds(5)
    }

    /// Token and wait-edge sweep interval (60 seconds).
    pub fn slow_maintenance_interval() -> Duration {
        Duration::seconds(60)
    }

    /// Worker token lifetime (24 hours).
    pub fn token_ttl() -> Duration {
        Duration::hours(24)
    }
}

/// A timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Check if a timestamp has passed.
pub fn is_expired(expiry: Timestamp) -> bool {
    now() > expiry
}

/// Calculate expiry time from now.
pub fn expires_in(duration: Duration) -> Timestamp {
    now() + duration
}

/// Unix epoch milliseconds, the wire representation of timestamps.
pub fn to_epoch_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

/// Inverse of [`to_epoch_millis`].
pub fn from_epoch_millis(millis: i64) -> Option<Timestamp> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Duration extensions for convenient conversion.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}

/// Conversion from std durations, saturating at a century.
pub trait StdDurationExt {
    fn to_chrono(&self) -> Duration;
}

impl StdDurationExt for std::time::Duration {
    fn to_chrono(&self) -> Duration {
        Duration::from_std(*self).unwrap_or_else(|_| Duration::days(36_500))
    }
}
