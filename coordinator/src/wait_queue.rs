//! Backlog of lock requests that could not be granted immediately.
//!
//! Entries are ordered by priority (highest first), then by their effective
//! timestamp, which starts at arrival and is pushed back by each retry's
//! backoff. A hard retry ceiling bounds how long any entry can wait.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use banklock_common::{Priority, RequestId, ResourceKey, StdDurationExt, WorkerId};
use banklock_protocol::{LockRequestMessage, QueueEntrySnapshot, QueueMetrics};

use crate::config::QueueConfig;
use crate::connection::ConnectionId;

/// A request to lock a set of resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    /// Canonically ordered, duplicate-free.
    pub resources: BTreeSet<ResourceKey>,
    pub priority: Priority,
    /// Requested hold time; `None` uses the configured default.
    pub timeout_ms: Option<u64>,
    pub operation: String,
    pub enqueued_at: DateTime<Utc>,
}

impl LockRequest {
    /// Build a request from its wire message.
    pub fn from_message(message: LockRequestMessage, now: DateTime<Utc>) -> Self {
        Self {
            request_id: message.request_id,
            worker_id: message.worker_id,
            resources: message.resources.into_iter().collect(),
            priority: message.priority,
            timeout_ms: message.timeout_ms,
            operation: message.operation,
            enqueued_at: now,
        }
    }

    /// Resources in canonical order, as sent on the wire.
    pub fn resource_list(&self) -> Vec<ResourceKey> {
        self.resources.iter().cloned().collect()
    }
}

/// A queued request.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub request: LockRequest,
    /// Connection the request arrived on.
    pub connection: ConnectionId,
    /// First arrival; never changes.
    pub arrival: DateTime<Utc>,
    /// Ordering timestamp; arrival plus the latest backoff.
    pub effective_at: DateTime<Utc>,
    pub retry_count: u32,
    /// Monotonic tie-breaker assigned on first enqueue.
    pub sequence: u64,
}

impl QueueEntry {
    /// Wrap a request that just arrived.
    pub fn new(request: LockRequest, connection: ConnectionId, now: DateTime<Utc>) -> Self {
        Self {
            request,
            connection,
            arrival: now,
            effective_at: now,
            retry_count: 0,
            sequence: 0,
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request.request_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.request.worker_id
    }
}

/// Outcome of [`WaitQueue::requeue_with_backoff`].
#[derive(Debug)]
pub enum Requeue {
    /// Back in the queue, reconsidered no earlier than after `backoff`.
    Scheduled { backoff: Duration },
    /// Retry ceiling exceeded; the entry was not re-added.
    Exhausted(QueueEntry),
}

/// Priority-ordered wait queue.
#[derive(Debug)]
pub struct WaitQueue {
    entries: VecDeque<QueueEntry>,
    config: QueueConfig,
    next_sequence: u64,
    denied_by_retry_exhaustion: u64,
    orphans_removed: u64,
}

impl WaitQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            config,
            next_sequence: 0,
            denied_by_retry_exhaustion: 0,
            orphans_removed: 0,
        }
    }

    /// Append a new entry. Call [`reorder`](Self::reorder) afterwards.
    pub fn enqueue(&mut self, mut entry: QueueEntry) {
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;

        info!(
            request_id = %entry.request_id(),
            worker_id = %entry.worker_id(),
            priority = %entry.request.priority,
            depth = self.entries.len() + 1,
            "Request queued"
        );
        self.entries.push_back(entry);
    }

    /// Stable sort: priority descending, then effective timestamp, then
    /// first arrival order.
    pub fn reorder(&mut self) {
        self.entries.make_contiguous().sort_by(|a, b| {
            b.request
                .priority
                .cmp(&a.request.priority)
                .then(a.effective_at.cmp(&b.effective_at))
                .then(a.sequence.cmp(&b.sequence))
        });
    }

    /// Pop the head of the queue.
    pub fn dequeue_front(&mut self) -> Option<QueueEntry> {
        self.entries.pop_front()
    }

    /// Count a retry against `entry` and put it back with exponential
    /// backoff, or hand it back if the retry ceiling is exceeded.
    pub fn requeue_with_backoff(&mut self, mut entry: QueueEntry, now: DateTime<Utc>) -> Requeue {
        entry.retry_count += 1;

        if entry.retry_count > self.config.max_retries {
            self.denied_by_retry_exhaustion += 1;
            info!(
                request_id = %entry.request_id(),
                worker_id = %entry.worker_id(),
                retries = entry.retry_count - 1,
                "Retry limit exceeded"
            );
            return Requeue::Exhausted(entry);
        }

        let backoff = self.backoff_for(entry.retry_count);
        entry.effective_at = now + backoff.to_chrono();

        debug!(
            request_id = %entry.request_id(),
            retry_count = entry.retry_count,
            backoff_ms = backoff.as_millis() as u64,
            "Request requeued"
        );
        self.entries.push_back(entry);
        Requeue::Scheduled { backoff }
    }

    /// `min(base * 2^(retry-1), max)`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.config
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff)
    }

    /// Remove and return every entry owned by `worker_id`.
    pub fn remove_by_worker(&mut self, worker_id: &WorkerId) -> Vec<QueueEntry> {
        self.extract(|entry| entry.worker_id() == worker_id)
    }

    /// Remove the entry for `request_id` if `worker_id` owns it.
    pub fn remove_request(&mut self, worker_id: &WorkerId, request_id: &RequestId) -> Option<QueueEntry> {
        let position = self
            .entries
            .iter()
            .position(|e| e.request_id() == request_id && e.worker_id() == worker_id)?;
        self.entries.remove(position)
    }

    /// Take the entry for `request_id` out of the queue, if present.
    pub fn take(&mut self, request_id: &RequestId) -> Option<QueueEntry> {
        let position = self.entries.iter().position(|e| e.request_id() == request_id)?;
        self.entries.remove(position)
    }

    /// Whether `request_id` is queued.
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.entries.iter().any(|e| e.request_id() == request_id)
    }

    /// Drop entries whose connection is no longer live.
    pub fn prune_orphans<F>(&mut self, mut is_live: F) -> usize
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let removed = self.extract(|entry| !is_live(entry)).len();
        if removed > 0 {
            self.orphans_removed += removed as u64;
            info!(removed, depth = self.entries.len(), "Orphaned queue entries pruned");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    /// Depth and cumulative counters.
    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            depth: self.entries.len(),
            denied_by_retry_exhaustion: self.denied_by_retry_exhaustion,
            orphans_removed: self.orphans_removed,
        }
    }

    /// Entries in queue order.
    pub fn snapshot(&self) -> Vec<QueueEntrySnapshot> {
        self.entries
            .iter()
            .map(|e| QueueEntrySnapshot {
                request_id: e.request.request_id.clone(),
                worker_id: e.request.worker_id.clone(),
                resources: e.request.resource_list(),
                priority: e.request.priority,
                operation: e.request.operation.clone(),
                retry_count: e.retry_count,
                arrived_at: e.arrival.timestamp_millis(),
            })
            .collect()
    }

    fn extract<F>(&mut self, mut predicate: F) -> Vec<QueueEntry>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if predicate(&entry) {
                taken.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        taken
    }
}
