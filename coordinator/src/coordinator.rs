//! Core coordinator implementation.
//!
//! All lock, queue, registry and wait-for state lives in one [`Core`] behind
//! a single mutex, so every message and maintenance pass is one logical step.
//! Outbound messages are queued on the connection hub while the lock is held,
//! which keeps per-connection delivery order identical to decision order.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use banklock_common::{BankLockError, RequestId, ResourceKey, Result, StdDurationExt, WorkerId};
use banklock_crypto::{IssuedToken, TokenSigner};
use banklock_protocol::{
    auth_errors, decode_client_message, reasons, AuthError, CancelRequest, ClientMessage,
    ForceRelease, Heartbeat, LockDenied, LockGranted, LockReleaseMessage, LockRequestMessage,
    RegisterWorker, ServerMessage, StatusSnapshot, WorkerRegistered,
};

use crate::config::CoordinatorConfig;
use crate::connection::{ConnectionHub, ConnectionId, OutboundReceiver};
use crate::deadlock_detector::DeadlockDetector;
use crate::lock_table::{GrantedLock, LockTable};
use crate::metrics::{Gauges, Metrics, SharedMetrics};
use crate::state::CoordinatorState;
use crate::wait_queue::{LockRequest, QueueEntry, Requeue, WaitQueue};
use crate::worker_registry::WorkerRegistry;

/// State owned exclusively by the coordinator.
struct Core {
    locks: LockTable,
    queue: WaitQueue,
    workers: WorkerRegistry,
    deadlocks: DeadlockDetector,
}

/// What one queue evaluation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    /// Entries considered.
    pub evaluated: usize,
    pub granted: Vec<RequestId>,
    /// Permanently denied on retry exhaustion.
    pub denied: Vec<RequestId>,
    /// Dropped because their worker is gone.
    pub dropped: usize,
    /// Request aborted to break a cycle.
    pub victim: Option<RequestId>,
}

/// What one fast maintenance pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Maintenance {
    pub evicted: Vec<WorkerId>,
    pub expired: Vec<RequestId>,
    pub orphans_pruned: usize,
    pub evaluation: Option<Evaluation>,
}

/// The lock coordinator.
pub struct Coordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Current coordinator state.
    state: RwLock<CoordinatorState>,
    /// Lock, queue, registry and wait-for state.
    core: Mutex<Core>,
    /// Open worker connections.
    hub: ConnectionHub,
    /// Event counters.
    metrics: SharedMetrics,
    /// Stops the maintenance loops.
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    /// Create a new coordinator instance.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        let signer = TokenSigner::new(&config.auth_config.secret, config.auth_config.token_ttl.to_chrono())
            .map_err(|e| BankLockError::ConfigurationError(e.to_string()))?;
        let (shutdown_tx, _) = watch::channel(false);

        let core = Core {
            locks: LockTable::new(),
            queue: WaitQueue::new(config.queue_config.clone()),
            workers: WorkerRegistry::new(signer),
            deadlocks: DeadlockDetector::new(),
        };

        Ok(Self {
            config,
            state: RwLock::new(CoordinatorState::Starting),
            core: Mutex::new(core),
            hub: ConnectionHub::new(),
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
        })
    }

    /// Start accepting requests and spawn the maintenance loops.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(service = %self.config.service_name, "Starting coordinator");

        *self.state.write() = CoordinatorState::Running;
        self.start_background_tasks();

        info!(service = %self.config.service_name, "Coordinator started successfully");
        Ok(())
    }

    /// Stop the coordinator and close every connection.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if self.state.read().is_terminal() {
            debug!("Coordinator already stopped");
            return Ok(());
        }
        info!("Stopping coordinator");

        *self.state.write() = CoordinatorState::ShuttingDown;
        let _ = self.shutdown_tx.send(true);

        let closed = self.hub.close_all();
        *self.state.write() = CoordinatorState::Stopped;

        info!(closed_connections = closed, "Coordinator stopped");
        Ok(())
    }

    /// Check if the coordinator is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    /// Get the current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Register a new socket.
    pub fn open_connection(&self) -> (ConnectionId, OutboundReceiver) {
        self.hub.open()
    }

    /// Decode, validate and handle one inbound text frame.
    ///
    /// Failures are answered or logged here and never propagate, so one bad
    /// frame cannot affect other connections.
    pub fn handle_frame(&self, connection: ConnectionId, text: &str) {
        self.metrics.message_received();

        let message = match decode_client_message(text) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.validation_failed();
                warn!(connection_id = %connection, tipo = %e.tipo, error = %e.error, "Invalid message");
                if !e.is_heartbeat() {
                    self.hub.send(connection, e.to_message());
                }
                return;
            }
        };

        let operation = message.event_name();
        let worker_id = message.worker_id().cloned();
        if let Err(e) = self.handle_message(connection, message) {
            warn!(
                connection_id = %connection,
                worker_id = ?worker_id.as_ref().map(WorkerId::as_str),
                operation,
                error_code = e.error_code(),
                error = %e,
                "Message handling failed"
            );
        }
    }

    /// Handle a decoded message.
    pub fn handle_message(&self, connection: ConnectionId, message: ClientMessage) -> Result<()> {
        self.handle_message_at(connection, message, Utc::now())
    }

    /// Handle a decoded message as of `now`.
    #[instrument(skip(self, message), fields(connection_id = %connection, event = message.event_name()))]
    pub fn handle_message_at(
        &self,
        connection: ConnectionId,
        message: ClientMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_accepting_requests() {
            return Err(BankLockError::CoordinatorUnavailable { retry_after_ms: 1000 });
        }

        if let ClientMessage::StatusRequest = message {
            let snapshot = self.stats();
            self.hub.send(connection, ServerMessage::StatusResponse(Box::new(snapshot)));
            return Ok(());
        }

        let mut guard = self.core.lock();
        let core = &mut *guard;
        match message {
            ClientMessage::RegisterWorker(m) => self.on_register(core, connection, m, now),
            ClientMessage::Heartbeat(m) => self.on_heartbeat(core, connection, m, now),
            ClientMessage::LockRequest(m) => self.on_lock_request(core, connection, m, now),
            ClientMessage::LockRelease(m) => self.on_lock_release(core, connection, m, now),
            ClientMessage::CancelRequest(m) => self.on_cancel(core, connection, m),
            ClientMessage::StatusRequest => Ok(()),
        }
    }

    /// Clean up after a socket closed.
    pub fn handle_disconnect(&self, connection: ConnectionId) {
        self.handle_disconnect_at(connection, Utc::now());
    }

    /// Clean up after a socket closed, as of `now`.
    #[instrument(skip(self), fields(connection_id = %connection))]
    pub fn handle_disconnect_at(&self, connection: ConnectionId, now: DateTime<Utc>) {
        self.hub.close(connection);

        let mut guard = self.core.lock();
        let core = &mut *guard;

        while let Some(record) = core.workers.find_by_connection(connection) {
            let worker_id = record.worker_id.clone();
            let (grants, entries) = Self::purge_worker(core, &worker_id);
            core.workers.remove(&worker_id);
            info!(
                worker_id = %worker_id,
                released_grants = grants,
                purged_requests = entries,
                "Worker disconnected"
            );
        }

        self.evaluate_core(core, now);
    }

    /// Re-evaluate the wait queue now.
    pub fn evaluate_queue(&self) -> Evaluation {
        self.evaluate_queue_at(Utc::now())
    }

    /// Re-evaluate the wait queue as of `now`.
    pub fn evaluate_queue_at(&self, now: DateTime<Utc>) -> Evaluation {
        let mut guard = self.core.lock();
        self.evaluate_core(&mut guard, now)
    }

    /// Heartbeat sweep, lock expiry sweep and orphan pruning.
    #[instrument(skip(self))]
    pub fn run_maintenance(&self, now: DateTime<Utc>) -> Maintenance {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        let mut report = Maintenance::default();

        let mut dead = Vec::new();
        core.workers.sweep_dead_workers(now, self.config.liveness_config.heartbeat_timeout, |record| {
            dead.push((record.worker_id.clone(), record.connection, record.last_heartbeat_at));
        });
        for (worker_id, connection, last_heartbeat_at) in dead {
            error!(
                worker_id = %worker_id,
                connection_id = %connection,
                last_heartbeat_at = %last_heartbeat_at,
                "Worker heartbeat timeout, forcing disconnect"
            );
            Self::purge_worker(core, &worker_id);
            core.workers.remove(&worker_id);
            self.hub.close(connection);
            self.metrics.worker_evicted();
            report.evicted.push(worker_id);
        }

        for expired in core.locks.sweep_expired(now) {
            let grant = &expired.grant;
            warn!(
                request_id = %grant.request_id,
                worker_id = %grant.worker_id,
                keys = expired.keys.len(),
                "Lock expired"
            );
            core.workers.decrement_locks(&grant.worker_id);
            self.metrics.lock_expired();
            if let Some(record) = core.workers.get(&grant.worker_id) {
                self.hub.send(
                    record.connection,
                    ServerMessage::ForceRelease(ForceRelease {
                        request_id: grant.request_id.clone(),
                    }),
                );
            }
            report.expired.push(grant.request_id.clone());
        }

        report.orphans_pruned = core.queue.prune_orphans(|e| self.hub.is_live(e.connection));

        if !report.evicted.is_empty() || !report.expired.is_empty() || !core.queue.is_empty() {
            report.evaluation = Some(self.evaluate_core(core, now));
        }
        report
    }

    /// Token expiry sweep and stale wait-edge pruning.
    #[instrument(skip(self))]
    pub fn run_slow_maintenance(&self, now: DateTime<Utc>) {
        let mut guard = self.core.lock();
        let tokens = guard.workers.sweep_expired_tokens(now);
        let edges = guard
            .deadlocks
            .prune_stale_edges(self.config.deadlock_config.edge_max_age, now);
        debug!(tokens, edges, "Slow maintenance complete");
    }

    /// Mint a worker token.
    pub fn issue_token(&self, worker_id: &WorkerId) -> IssuedToken {
        self.core.lock().workers.issue_token(worker_id, Utc::now())
    }

    /// Full statistics snapshot.
    pub fn stats(&self) -> StatusSnapshot {
        let core = self.core.lock();
        StatusSnapshot {
            state: self.state().to_string(),
            active_workers: core.workers.len(),
            active_locks: core.locks.grant_count(),
            queue_depth: core.queue.len(),
            open_connections: self.hub.count(),
            issued_tokens: core.workers.issued_token_count(),
            workers: core.workers.snapshot(),
            locks: core.locks.snapshot(),
            queue: core.queue.snapshot(),
            deadlock: core.deadlocks.stats(),
            queue_metrics: core.queue.metrics(),
            counters: self.metrics.snapshot(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Prometheus exposition of counters and table sizes.
    pub fn prometheus(&self) -> String {
        let gauges = {
            let core = self.core.lock();
            Gauges {
                workers: core.workers.len(),
                locks: core.locks.key_count(),
                queue_depth: core.queue.len(),
                connections: self.hub.count(),
            }
        };
        self.metrics.to_prometheus(&gauges)
    }

    // --- Message handlers ---

    fn on_register(
        &self,
        core: &mut Core,
        connection: ConnectionId,
        claim: RegisterWorker,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let previous = match core.workers.register(connection, &claim, now) {
            Ok(previous) => previous,
            Err(e) => {
                self.metrics.auth_failed();
                self.hub.send(
                    connection,
                    ServerMessage::AuthError(AuthError {
                        error: auth_errors::INVALID_TOKEN.to_string(),
                        worker_id: Some(claim.worker_id.clone()),
                        request_id: None,
                    }),
                );
                self.hub.close(connection);
                return Err(e);
            }
        };

        let mut purged = false;
        if let Some(previous) = previous {
            let (grants, entries) = Self::purge_worker(core, &previous.worker_id);
            purged = grants + entries > 0;
            if previous.connection != connection {
                self.hub.close(previous.connection);
            }
            info!(
                worker_id = %claim.worker_id,
                released_grants = grants,
                purged_requests = entries,
                "Previous registration replaced"
            );
        }

        self.metrics.worker_registered();
        self.hub.send(
            connection,
            ServerMessage::WorkerRegistered(WorkerRegistered {
                worker_id: claim.worker_id,
                request_id: RequestId::generate(),
            }),
        );

        if purged {
            self.evaluate_core(core, now);
        }
        Ok(())
    }

    fn on_heartbeat(
        &self,
        core: &mut Core,
        connection: ConnectionId,
        heartbeat: Heartbeat,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !core.workers.is_authenticated_on(&heartbeat.worker_id, connection) {
            debug!(worker_id = %heartbeat.worker_id, "Heartbeat from unregistered connection ignored");
            return Ok(());
        }
        core.workers
            .record_heartbeat(&heartbeat.worker_id, heartbeat.status, heartbeat.active_locks, now);
        Ok(())
    }

    fn on_lock_request(
        &self,
        core: &mut Core,
        connection: ConnectionId,
        message: LockRequestMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let worker_id = message.worker_id.clone();
        self.require_authenticated(core, connection, &worker_id, Some(&message.request_id))?;

        let request = LockRequest::from_message(message, now);
        let request_id = request.request_id.clone();

        // At-least-once delivery: a repeated request id is a retry, not a new request.
        if let Some(grant) = core.locks.get_by_request(&request_id) {
            if grant.worker_id != worker_id {
                return Err(request_id_in_use(&request_id));
            }
            debug!(request_id = %request_id, "Duplicate request for live grant, re-sending grant");
            self.hub.send(connection, granted_message(&grant));
            return Ok(());
        }
        if let Some(entry) = core.queue.remove_request(&worker_id, &request_id) {
            return self.retry_queued(core, entry, now);
        }
        if core.queue.contains(&request_id) {
            return Err(request_id_in_use(&request_id));
        }

        if core.workers.is_at_capacity(&worker_id) {
            info!(worker_id = %worker_id, request_id = %request_id, "Worker at capacity, request queued");
            self.enqueue(core, QueueEntry::new(request, connection, now));
            return Ok(());
        }

        let conflicts = conflicting_holders(&core.locks, &request);
        let Some((_, blocked_by)) = conflicts.first().cloned() else {
            self.grant(core, &request, connection, now);
            return Ok(());
        };

        for (key, holder) in &conflicts {
            core.deadlocks.record_wait(&worker_id, holder, key, &request_id, now);
        }
        let resources = request.resource_list();
        info!(
            worker_id = %worker_id,
            request_id = %request_id,
            blocked_by = %blocked_by,
            "Resources occupied, request queued"
        );
        self.enqueue(core, QueueEntry::new(request, connection, now));
        self.hub.send(
            connection,
            ServerMessage::LockDenied(LockDenied {
                worker_id,
                request_id,
                resources,
                razon: reasons::QUEUED.to_string(),
                blocked_by: Some(blocked_by),
            }),
        );
        Ok(())
    }

    fn on_lock_release(
        &self,
        core: &mut Core,
        connection: ConnectionId,
        message: LockReleaseMessage,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let worker_id = message.worker_id;
        self.require_authenticated(core, connection, &worker_id, Some(&message.request_id))?;

        let keys: std::collections::BTreeSet<ResourceKey> = message.resources.into_iter().collect();
        for key in &keys {
            if let Some(holder) = core.locks.holder_of(key) {
                if holder.worker_id != worker_id {
                    return Err(BankLockError::NotLockOwner {
                        resource: key.canonical(),
                        owner: holder.worker_id.clone(),
                        requester: worker_id,
                    });
                }
            }
        }

        let release = core.locks.release(&keys);
        for grant in &release.completed {
            core.workers.decrement_locks(&grant.worker_id);
            self.metrics.lock_released();
        }
        info!(
            worker_id = %worker_id,
            request_id = %message.request_id,
            released_keys = release.keys.len(),
            completed_grants = release.completed.len(),
            "Locks released"
        );

        self.evaluate_core(core, now);
        Ok(())
    }

    fn on_cancel(&self, core: &mut Core, connection: ConnectionId, message: CancelRequest) -> Result<()> {
        self.require_authenticated(core, connection, &message.worker_id, Some(&message.request_id))?;

        let Some(entry) = core.queue.remove_request(&message.worker_id, &message.request_id) else {
            debug!(request_id = %message.request_id, "Cancel for request not in queue");
            return Ok(());
        };

        core.deadlocks.clear_request(entry.request_id());
        self.metrics.request_cancelled();
        info!(worker_id = %message.worker_id, request_id = %message.request_id, "Request cancelled");
        self.send_denial(&entry, reasons::CANCELLED, None);
        Ok(())
    }

    // --- Queue processing ---

    fn evaluate_core(&self, core: &mut Core, now: DateTime<Utc>) -> Evaluation {
        let mut evaluation = Evaluation::default();

        core.queue.prune_orphans(|e| self.hub.is_live(e.connection));

        let budget = core
            .queue
            .len()
            .min(self.config.queue_config.max_evaluations_per_pass);

        for _ in 0..budget {
            let Some(entry) = core.queue.dequeue_front() else {
                break;
            };
            evaluation.evaluated += 1;
            let worker_id = entry.worker_id().clone();

            if !core.workers.is_authenticated_on(&worker_id, entry.connection) {
                debug!(request_id = %entry.request_id(), "Dropping request of departed worker");
                core.deadlocks.clear_request(entry.request_id());
                evaluation.dropped += 1;
                continue;
            }

            if core.workers.is_at_capacity(&worker_id) {
                if let Requeue::Exhausted(entry) = core.queue.requeue_with_backoff(entry, now) {
                    core.deadlocks.clear_request(entry.request_id());
                    self.deny(&entry, reasons::RETRY_LIMIT);
                    evaluation.denied.push(entry.request_id().clone());
                }
                continue;
            }

            let conflicts = conflicting_holders(&core.locks, &entry.request);
            if conflicts.is_empty() {
                self.grant(core, &entry.request, entry.connection, now);
                evaluation.granted.push(entry.request_id().clone());
                continue;
            }

            core.deadlocks.clear_request(entry.request_id());
            for (key, holder) in &conflicts {
                core.deadlocks
                    .record_wait(&worker_id, holder, key, entry.request_id(), now);
            }
            if let Requeue::Exhausted(entry) = core.queue.requeue_with_backoff(entry, now) {
                core.deadlocks.clear_wait(&worker_id);
                self.deny(&entry, reasons::RETRY_LIMIT_OCCUPIED);
                evaluation.denied.push(entry.request_id().clone());
            }
        }

        core.queue.reorder();

        if let Some(cycle) = core.deadlocks.detect_cycle() {
            let victim_id = core
                .deadlocks
                .select_victim(&cycle, core.queue.iter())
                .map(|e| e.request_id().clone());

            match victim_id.and_then(|id| core.queue.take(&id)) {
                Some(victim) => {
                    core.deadlocks.resolve(&victim);
                    self.metrics.deadlock_resolved();
                    self.deny(&victim, reasons::DEADLOCK_VICTIM);
                    evaluation.victim = Some(victim.request_id().clone());
                }
                None => debug!("Cycle has no queued victim, edges are stale"),
            }
        }

        if !evaluation.granted.is_empty() || !evaluation.denied.is_empty() {
            debug!(
                evaluated = evaluation.evaluated,
                granted = evaluation.granted.len(),
                denied = evaluation.denied.len(),
                depth = core.queue.len(),
                "Queue evaluated"
            );
        }
        evaluation
    }

    /// Count a repeated LOCK_REQUEST against its queued entry.
    fn retry_queued(&self, core: &mut Core, entry: QueueEntry, now: DateTime<Utc>) -> Result<()> {
        let blocked_by = core
            .locks
            .check_conflict(&entry.request.resources)
            .map(|g| g.worker_id.clone());
        let advisory = ServerMessage::LockDenied(LockDenied {
            worker_id: entry.worker_id().clone(),
            request_id: entry.request_id().clone(),
            resources: entry.request.resource_list(),
            razon: reasons::QUEUED.to_string(),
            blocked_by: blocked_by.clone(),
        });
        let connection = entry.connection;

        match core.queue.requeue_with_backoff(entry, now) {
            Requeue::Scheduled { .. } => {
                core.queue.reorder();
                // Capacity-queued requests get no advisory.
                if blocked_by.is_some() {
                    self.hub.send(connection, advisory);
                }
            }
            Requeue::Exhausted(entry) => {
                core.deadlocks.clear_request(entry.request_id());
                self.deny(&entry, reasons::RETRY_LIMIT);
            }
        }
        Ok(())
    }

    fn enqueue(&self, core: &mut Core, entry: QueueEntry) {
        core.queue.enqueue(entry);
        core.queue.reorder();
        self.metrics.request_queued();
    }

    fn grant(&self, core: &mut Core, request: &LockRequest, connection: ConnectionId, now: DateTime<Utc>) {
        let grant = core.locks.grant(request, &self.config.lock_config, now);
        core.workers.increment_locks(&request.worker_id);
        core.deadlocks.clear_wait(&request.worker_id);
        self.metrics.lock_granted();

        info!(
            worker_id = %grant.worker_id,
            request_id = %grant.request_id,
            operation = %grant.operation,
            keys = grant.resources.len(),
            "Lock granted"
        );
        self.hub.send(connection, granted_message(&grant));
    }

    /// Permanent denial.
    fn deny(&self, entry: &QueueEntry, reason: &str) {
        self.metrics.request_denied();
        info!(
            worker_id = %entry.worker_id(),
            request_id = %entry.request_id(),
            reason,
            "Request denied"
        );
        self.send_denial(entry, reason, None);
    }

    fn send_denial(&self, entry: &QueueEntry, reason: &str, blocked_by: Option<WorkerId>) {
        self.hub.send(
            entry.connection,
            ServerMessage::LockDenied(LockDenied {
                worker_id: entry.worker_id().clone(),
                request_id: entry.request_id().clone(),
                resources: entry.request.resource_list(),
                razon: reason.to_string(),
                blocked_by,
            }),
        );
    }

    fn require_authenticated(
        &self,
        core: &Core,
        connection: ConnectionId,
        worker_id: &WorkerId,
        request_id: Option<&RequestId>,
    ) -> Result<()> {
        if core.workers.is_authenticated_on(worker_id, connection) {
            return Ok(());
        }
        self.metrics.auth_failed();
        self.hub.send(
            connection,
            ServerMessage::AuthError(AuthError {
                error: auth_errors::NOT_AUTHENTICATED.to_string(),
                worker_id: Some(worker_id.clone()),
                request_id: request_id.cloned(),
            }),
        );
        Err(BankLockError::NotAuthenticated(worker_id.clone()))
    }

    /// Drop every grant, queue entry and wait edge of `worker_id`. The
    /// registry record is left to the caller.
    fn purge_worker(core: &mut Core, worker_id: &WorkerId) -> (usize, usize) {
        let grants = core.locks.release_worker(worker_id).len();
        let entries = core.queue.remove_by_worker(worker_id).len();
        core.deadlocks.forget_worker(worker_id);
        (grants, entries)
    }

    fn start_background_tasks(self: &Arc<Self>) {
        let fast = self.config.liveness_config.maintenance_interval;
        let slow = self.config.deadlock_config.slow_maintenance_interval;

        let coordinator = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            run_every(fast, shutdown, || {
                coordinator.run_maintenance(Utc::now());
            })
            .await;
        });

        let coordinator = Arc::clone(self);
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            run_every(slow, shutdown, || coordinator.run_slow_maintenance(Utc::now())).await;
        });
    }
}

async fn run_every<F>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F)
where
    F: FnMut(),
{
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => tick(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

fn conflicting_holders(locks: &LockTable, request: &LockRequest) -> Vec<(ResourceKey, WorkerId)> {
    locks
        .conflicts(&request.resources)
        .into_iter()
        .map(|(key, holder)| (key.clone(), holder.worker_id.clone()))
        .collect()
}

fn granted_message(grant: &GrantedLock) -> ServerMessage {
    ServerMessage::LockGranted(LockGranted {
        worker_id: grant.worker_id.clone(),
        request_id: grant.request_id.clone(),
        resources: grant.resources.iter().cloned().collect(),
        expires_at: grant.expires_at.timestamp_millis(),
    })
}

fn request_id_in_use(request_id: &RequestId) -> BankLockError {
    BankLockError::InvalidMessage {
        message: format!("requestId {} belongs to another worker", request_id),
        field: Some("requestId".to_string()),
    }
}
