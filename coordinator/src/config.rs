//! Coordinator configuration.

use std::time::Duration;

use banklock_common::constants;
use banklock_common::DurationExt;

/// Lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Hold time used when a request names no timeout.
    pub default_duration: Duration,
    /// Server-enforced ceiling; longer requests are clamped to this.
    pub max_duration: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_duration: constants::default_lock_duration().as_std(),
            max_duration: constants::max_lock_duration().as_std(),
        }
    }
}

/// Wait queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Re-queue attempts before a request is permanently denied.
    pub max_retries: u32,
    /// Backoff after the first retry; doubles per retry.
    pub base_backoff: Duration,
    /// Backoff cap.
    pub max_backoff: Duration,
    /// Safety valve on queue entries evaluated in one pass.
    pub max_evaluations_per_pass: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            max_evaluations_per_pass: 100,
        }
    }
}

/// Worker liveness configuration.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Evict workers silent for longer than this.
    pub heartbeat_timeout: Duration,
    /// Heartbeat sweep, lock expiry sweep and orphan pruning interval.
    pub maintenance_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: constants::heartbeat_timeout().as_std(),
            maintenance_interval: constants::maintenance_interval().as_std(),
        }
    }
}

/// Deadlock detection configuration.
#[derive(Debug, Clone)]
pub struct DeadlockConfig {
    /// Wait-for edges older than this are discarded.
    pub edge_max_age: Duration,
    /// Token expiry and stale edge sweep interval.
    pub slow_maintenance_interval: Duration,
}

impl Default for DeadlockConfig {
    fn default() -> Self {
        Self {
            edge_max_age: Duration::from_secs(60),
            slow_maintenance_interval: constants::slow_maintenance_interval().as_std(),
        }
    }
}

/// Worker authentication configuration.
#[derive(Clone)]
pub struct AuthConfig {
    /// HMAC secret for worker tokens.
    pub secret: String,
    /// Lifetime of minted tokens.
    pub token_ttl: Duration,
    /// When set, `/api/generate-token` requires `Authorization: Bearer <key>`.
    pub admin_key: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("secret", &"<redacted>")
            .field("token_ttl", &self.token_ttl)
            .field("admin_key", &self.admin_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: banklock_crypto::generate_secret(),
            token_ttl: constants::token_ttl().as_std(),
            admin_key: None,
        }
    }
}

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Service name reported by the health endpoint.
    pub service_name: String,
    /// Listen address.
    pub listen_addr: String,
    /// Listen port.
    pub listen_port: u16,
    /// Lock configuration.
    pub lock_config: LockConfig,
    /// Wait queue configuration.
    pub queue_config: QueueConfig,
    /// Worker liveness configuration.
    pub liveness_config: LivenessConfig,
    /// Deadlock detection configuration.
    pub deadlock_config: DeadlockConfig,
    /// Authentication configuration.
    pub auth_config: AuthConfig,
    /// Whether the secret was supplied rather than generated at startup.
    pub secret_from_env: bool,
    /// Log level.
    pub log_level: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            service_name: "lock-coordinator".to_string(),
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 3000,
            lock_config: LockConfig::default(),
            queue_config: QueueConfig::default(),
            liveness_config: LivenessConfig::default(),
            deadlock_config: DeadlockConfig::default(),
            auth_config: AuthConfig::default(),
            secret_from_env: false,
            log_level: "info".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("COORDINATOR_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Ok(port) = std::env::var("COORDINATOR_LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                config.listen_port = port;
            }
        }

        if let Ok(secret) = std::env::var("COORDINATOR_SECRET") {
            config.auth_config.secret = secret;
            config.secret_from_env = true;
        }

        if let Ok(key) = std::env::var("COORDINATOR_ADMIN_KEY") {
            if !key.is_empty() {
                config.auth_config.admin_key = Some(key);
            }
        }

        if let Some(ms) = env_millis("COORDINATOR_MAX_LOCK_MS") {
            config.lock_config.max_duration = ms;
        }

        if let Some(ms) = env_millis("COORDINATOR_HEARTBEAT_TIMEOUT_MS") {
            config.liveness_config.heartbeat_timeout = ms;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_port == 0 {
            return Err("Listen port cannot be 0".to_string());
        }

        if self.lock_config.default_duration > self.lock_config.max_duration {
            return Err("Default lock duration cannot exceed max duration".to_string());
        }

        if self.lock_config.max_duration.is_zero() {
            return Err("Max lock duration cannot be zero".to_string());
        }

        if self.queue_config.max_evaluations_per_pass == 0 {
            return Err("Queue evaluation budget cannot be zero".to_string());
        }

        if self.liveness_config.heartbeat_timeout <= self.liveness_config.maintenance_interval {
            return Err("Heartbeat timeout must exceed the maintenance interval".to_string());
        }

        if self.auth_config.secret.len() < banklock_crypto::token::MIN_SECRET_LEN {
            return Err(format!(
                "Secret must be at least {} bytes",
                banklock_crypto::token::MIN_SECRET_LEN
            ));
        }

        Ok(())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}
