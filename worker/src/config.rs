//! Worker client configuration.

use std::time::Duration;

use banklock_common::{constants, DurationExt, WorkerId};

/// Configuration for the worker client.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// WebSocket URL of the coordinator.
    pub coordinator_url: String,
    /// Identity this worker registers under.
    pub worker_id: WorkerId,
    /// Token minted by the coordinator for `worker_id`.
    pub token: Option<String>,
    /// Maximum grants held at once.
    pub capacity: usize,
    /// Port the worker serves its own clients on.
    pub listen_port: u16,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Connect and registration timeout.
    pub connection_timeout: Duration,
    /// How long `acquire` waits for a grant before cancelling.
    pub acquire_timeout: Duration,
    /// Hold time requested with each lock; the coordinator default when unset.
    pub lock_timeout: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "ws://127.0.0.1:3000/ws".to_string(),
            worker_id: WorkerId::new("worker-1"),
            token: None,
            capacity: 5,
            listen_port: 3001,
            heartbeat_interval: constants::heartbeat_interval().as_std(),
            connection_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(10),
            lock_timeout: None,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("COORDINATOR_URL") {
            config.coordinator_url = url;
        }

        if let Ok(id) = std::env::var("WORKER_ID") {
            config.worker_id = WorkerId::new(id);
        }

        if let Ok(token) = std::env::var("WORKER_TOKEN") {
            config.token = Some(token);
        }

        if let Ok(capacity) = std::env::var("WORKER_CAPACITY") {
            if let Ok(capacity) = capacity.parse() {
                config.capacity = capacity;
            }
        }

        if let Ok(port) = std::env::var("WORKER_PORT") {
            if let Ok(port) = port.parse() {
                config.listen_port = port;
            }
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.coordinator_url.is_empty() {
            return Err("Coordinator URL cannot be empty".to_string());
        }

        if !self.worker_id.is_valid() {
            return Err("Worker ID cannot be empty".to_string());
        }

        if self.capacity == 0 {
            return Err("Capacity must be at least 1".to_string());
        }

        if self.heartbeat_interval.is_zero() {
            return Err("Heartbeat interval cannot be zero".to_string());
        }

        Ok(())
    }
}
