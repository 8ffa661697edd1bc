//! Worker identity, authentication, capacity and liveness.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use banklock_common::{BankLockError, Result, StdDurationExt, WorkerId};
use banklock_crypto::{IssuedToken, TokenSigner};
use banklock_protocol::{RegisterWorker, WorkerSnapshot, WorkerStatus};

use crate::connection::ConnectionId;

/// A registered worker.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    /// Connection the worker registered on.
    pub connection: ConnectionId,
    pub listen_port: u16,
    /// BUSY while `active_lock_count > 0`.
    pub status: WorkerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Grants attributable to this worker; maintained incrementally.
    pub active_lock_count: usize,
    /// Declared concurrency budget.
    pub capacity: usize,
    pub authenticated: bool,
    pub registered_at: DateTime<Utc>,
    /// Values last reported by the worker's heartbeat.
    pub reported_status: Option<WorkerStatus>,
    pub reported_lock_count: Option<usize>,
}

impl WorkerRecord {
    /// Whether a new grant would exceed the worker's capacity.
    pub fn is_at_capacity(&self) -> bool {
        self.active_lock_count >= self.capacity
    }

    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            worker_id: self.worker_id.clone(),
            listen_port: self.listen_port,
            status: self.status,
            active_lock_count: self.active_lock_count,
            capacity: self.capacity,
            authenticated: self.authenticated,
            last_heartbeat_at: self.last_heartbeat_at.timestamp_millis(),
            reported_lock_count: self.reported_lock_count,
        }
    }
}

/// Registry of authenticated workers.
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerRecord>,
    signer: TokenSigner,
    /// Tokens minted through [`issue_token`](Self::issue_token), by worker.
    issued: HashMap<WorkerId, IssuedToken>,
}

impl WorkerRegistry {
    /// Create an empty registry verifying tokens with `signer`.
    pub fn new(signer: TokenSigner) -> Self {
        Self {
            workers: HashMap::new(),
            signer,
            issued: HashMap::new(),
        }
    }

    /// Authenticate and register a worker.
    ///
    /// On success the record is created or overwritten and the previous
    /// record, if any, is returned so the caller can purge its state. On an
    /// invalid or missing token no record is touched.
    pub fn register(
        &mut self,
        connection: ConnectionId,
        claim: &RegisterWorker,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerRecord>> {
        let token = claim.token.as_deref().unwrap_or_default();
        if token.is_empty() {
            warn!(worker_id = %claim.worker_id, "Registration without token");
            return Err(BankLockError::AuthenticationFailed {
                worker_id: claim.worker_id.clone(),
                reason: "missing token".to_string(),
            });
        }

        if let Err(e) = self.signer.verify(&claim.worker_id, token, now) {
            warn!(worker_id = %claim.worker_id, error = %e, "Token rejected");
            return Err(BankLockError::AuthenticationFailed {
                worker_id: claim.worker_id.clone(),
                reason: e.to_string(),
            });
        }

        let record = WorkerRecord {
            worker_id: claim.worker_id.clone(),
            connection,
            listen_port: claim.listen_port,
            status: WorkerStatus::Idle,
            last_heartbeat_at: now,
            active_lock_count: 0,
            capacity: claim.capacity,
            authenticated: true,
            registered_at: now,
            reported_status: None,
            reported_lock_count: None,
        };

        let previous = self.workers.insert(claim.worker_id.clone(), record);
        info!(
            worker_id = %claim.worker_id,
            connection_id = %connection,
            capacity = claim.capacity,
            replaced = previous.is_some(),
            "Worker registered"
        );
        Ok(previous)
    }

    pub fn is_authenticated(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .get(worker_id)
            .map(|r| r.authenticated)
            .unwrap_or(false)
    }

    /// Authenticated and speaking on the connection it registered on.
    pub fn is_authenticated_on(&self, worker_id: &WorkerId, connection: ConnectionId) -> bool {
        self.workers
            .get(worker_id)
            .map(|r| r.authenticated && r.connection == connection)
            .unwrap_or(false)
    }

    /// Refresh liveness and mirror the worker's own counters. Returns false
    /// for unknown workers.
    pub fn record_heartbeat(
        &mut self,
        worker_id: &WorkerId,
        status: WorkerStatus,
        active_locks: usize,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(record) = self.workers.get_mut(worker_id) else {
            return false;
        };
        record.last_heartbeat_at = now;
        record.reported_status = Some(status);
        record.reported_lock_count = Some(active_locks);
        if active_locks != record.active_lock_count {
            tracing::debug!(
                worker_id = %worker_id,
                reported = active_locks,
                tracked = record.active_lock_count,
                "Worker-reported lock count differs"
            );
        }
        true
    }

    pub fn increment_locks(&mut self, worker_id: &WorkerId) {
        if let Some(record) = self.workers.get_mut(worker_id) {
            record.active_lock_count += 1;
            record.status = WorkerStatus::Busy;
        }
    }

    pub fn decrement_locks(&mut self, worker_id: &WorkerId) {
        if let Some(record) = self.workers.get_mut(worker_id) {
            record.active_lock_count = record.active_lock_count.saturating_sub(1);
            if record.active_lock_count == 0 {
                record.status = WorkerStatus::Idle;
            }
        }
    }

    /// Inclusive capacity check; unknown workers count as at capacity.
    pub fn is_at_capacity(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .get(worker_id)
            .map(WorkerRecord::is_at_capacity)
            .unwrap_or(true)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(worker_id)
    }

    pub fn find_by_connection(&self, connection: ConnectionId) -> Option<&WorkerRecord> {
        self.workers.values().find(|r| r.connection == connection)
    }

    pub fn remove(&mut self, worker_id: &WorkerId) -> Option<WorkerRecord> {
        self.workers.remove(worker_id)
    }

    /// Invoke `force_disconnect` for every worker silent for longer than
    /// `timeout`. The callback is responsible for cleanup.
    pub fn sweep_dead_workers<F>(&self, now: DateTime<Utc>, timeout: Duration, mut force_disconnect: F) -> usize
    where
        F: FnMut(&WorkerRecord),
    {
        let timeout = timeout.to_chrono();
        let mut dead: Vec<&WorkerRecord> = self
            .workers
            .values()
            .filter(|r| now - r.last_heartbeat_at > timeout)
            .collect();
        dead.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        for record in &dead {
            force_disconnect(record);
        }
        dead.len()
    }

    /// Mint a token for `worker_id`.
    pub fn issue_token(&mut self, worker_id: &WorkerId, now: DateTime<Utc>) -> IssuedToken {
        let issued = self.signer.issue(worker_id, now);
        info!(worker_id = %worker_id, expires_at = %issued.expires_at, "Token issued");
        self.issued.insert(worker_id.clone(), issued.clone());
        issued
    }

    /// Forget minted tokens that have expired.
    pub fn sweep_expired_tokens(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, t| t.expires_at > now);
        let removed = before - self.issued.len();
        if removed > 0 {
            info!(removed, "Expired tokens swept");
        }
        removed
    }

    pub fn issued_token_count(&self) -> usize {
        self.issued.len()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// All workers, ordered by id.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> = self.workers.values().map(WorkerRecord::snapshot).collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }
}
