//! Coordinator statistics snapshot.
//!
//! Returned in `status-response` frames and by `GET /api/stats`.

use banklock_common::{Priority, RequestId, ResourceKey, WorkerId};
use serde::{Deserialize, Serialize};

use crate::messages::WorkerStatus;

/// One registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub listen_port: u16,
    pub status: WorkerStatus,
    pub active_lock_count: usize,
    pub capacity: usize,
    pub authenticated: bool,
    /// Epoch milliseconds.
    pub last_heartbeat_at: i64,
    /// Lock count the worker itself last reported.
    pub reported_lock_count: Option<usize>,
}

/// One locked resource key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockSnapshot {
    pub resource: String,
    pub worker_id: WorkerId,
    pub request_id: RequestId,
    pub operation: String,
    pub priority: Priority,
    pub granted_at: i64,
    pub expires_at: i64,
}

/// One waiting request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntrySnapshot {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub resources: Vec<ResourceKey>,
    pub priority: Priority,
    pub operation: String,
    pub retry_count: u32,
    pub arrived_at: i64,
}

/// Cumulative wait-queue bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub depth: usize,
    pub denied_by_retry_exhaustion: u64,
    pub orphans_removed: u64,
}

/// Deadlock detector bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadlockStats {
    pub wait_edges: usize,
    pub cycles_detected: u64,
    pub victims_selected: u64,
    pub stale_edges_pruned: u64,
}

/// Coordinator event counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub messages_received: u64,
    pub validation_failures: u64,
    pub auth_failures: u64,
    pub locks_granted: u64,
    pub locks_released: u64,
    pub locks_expired: u64,
    pub requests_queued: u64,
    pub requests_denied: u64,
    pub requests_cancelled: u64,
    pub deadlocks_resolved: u64,
    pub workers_registered: u64,
    pub workers_evicted: u64,
}

/// Full coordinator snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: String,
    pub active_workers: usize,
    pub active_locks: usize,
    pub queue_depth: usize,
    pub open_connections: usize,
    pub issued_tokens: usize,
    pub workers: Vec<WorkerSnapshot>,
    pub locks: Vec<LockSnapshot>,
    pub queue: Vec<QueueEntrySnapshot>,
    pub deadlock: DeadlockStats,
    pub queue_metrics: QueueMetrics,
    pub counters: CounterSnapshot,
    /// Epoch milliseconds.
    pub timestamp: i64,
}
