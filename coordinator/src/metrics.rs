//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use banklock_protocol::CounterSnapshot;

/// Coordinator event counters.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Inbound frames, valid or not.
    pub messages_received: AtomicU64,
    /// Frames rejected by decoding or validation.
    pub validation_failures: AtomicU64,
    /// Rejected registrations and unauthenticated lock messages.
    pub auth_failures: AtomicU64,
    /// Grants made.
    pub locks_granted: AtomicU64,
    /// Grants fully released by their owner.
    pub locks_released: AtomicU64,
    /// Grants removed by the expiry sweep.
    pub locks_expired: AtomicU64,
    /// Requests that entered the wait queue.
    pub requests_queued: AtomicU64,
    /// Permanent denials.
    pub requests_denied: AtomicU64,
    /// Requests withdrawn by their worker.
    pub requests_cancelled: AtomicU64,
    /// Cycles broken by aborting a victim.
    pub deadlocks_resolved: AtomicU64,
    /// Successful registrations.
    pub workers_registered: AtomicU64,
    /// Workers evicted for missing heartbeats.
    pub workers_evicted: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn validation_failed(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failed(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_granted(&self) {
        self.locks_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_released(&self) {
        self.locks_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn lock_expired(&self) {
        self.locks_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_queued(&self) {
        self.requests_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_denied(&self) {
        self.requests_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_cancelled(&self) {
        self.requests_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deadlock_resolved(&self) {
        self.deadlocks_resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_registered(&self) {
        self.workers_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn worker_evicted(&self) {
        self.workers_evicted.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            locks_granted: self.locks_granted.load(Ordering::Relaxed),
            locks_released: self.locks_released.load(Ordering::Relaxed),
            locks_expired: self.locks_expired.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_denied: self.requests_denied.load(Ordering::Relaxed),
            requests_cancelled: self.requests_cancelled.load(Ordering::Relaxed),
            deadlocks_resolved: self.deadlocks_resolved.load(Ordering::Relaxed),
            workers_registered: self.workers_registered.load(Ordering::Relaxed),
            workers_evicted: self.workers_evicted.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format, with gauges for the current
    /// table sizes.
    pub fn to_prometheus(&self, gauges: &Gauges) -> String {
        let s = self.snapshot();
        let counters = [
            ("messages_received_total", "Inbound frames", s.messages_received),
            ("validation_failures_total", "Frames rejected by validation", s.validation_failures),
            ("auth_failures_total", "Authentication failures", s.auth_failures),
            ("locks_granted_total", "Locks granted", s.locks_granted),
            ("locks_released_total", "Locks released by their owner", s.locks_released),
            ("locks_expired_total", "Locks removed on expiry", s.locks_expired),
            ("requests_queued_total", "Requests placed in the wait queue", s.requests_queued),
            ("requests_denied_total", "Requests permanently denied", s.requests_denied),
            ("requests_cancelled_total", "Requests cancelled by their worker", s.requests_cancelled),
            ("deadlocks_resolved_total", "Deadlock cycles resolved", s.deadlocks_resolved),
            ("workers_registered_total", "Worker registrations", s.workers_registered),
            ("workers_evicted_total", "Workers evicted on heartbeat timeout", s.workers_evicted),
        ];
        let gauges = [
            ("workers_active", "Registered workers", gauges.workers),
            ("locks_active", "Locked resource keys", gauges.locks),
            ("queue_depth", "Queued requests", gauges.queue_depth),
            ("connections_open", "Open connections", gauges.connections),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            out.push_str(&format!(
                "# HELP banklock_{name} {help}\n# TYPE banklock_{name} counter\nbanklock_{name} {value}\n\n"
            ));
        }
        for (name, help, value) in gauges {
            out.push_str(&format!(
                "# HELP banklock_{name} {help}\n# TYPE banklock_{name} gauge\nbanklock_{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Point-in-time table sizes exported alongside the counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gauges {
    pub workers: usize,
    pub locks: usize,
    pub queue_depth: usize,
    pub connections: usize,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
