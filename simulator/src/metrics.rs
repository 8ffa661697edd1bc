//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Transfers attempted.
    pub total_transfers: u64,
    /// Transfers that held their locks and moved funds.
    pub completed_transfers: u64,
    /// Permanent denials, by reason.
    pub denials: BTreeMap<String, u64>,
    /// Acquire timeouts.
    pub timeouts: u64,
    /// Locks held but the transfer itself failed.
    pub insufficient_funds: u64,
    /// Overlapping critical sections observed.
    pub exclusion_violations: u64,
    /// Client or transport errors.
    pub errors: u64,
    /// Lock wait samples (ms).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transfers: 0,
            completed_transfers: 0,
            denials: BTreeMap::new(),
            timeouts: 0,
            insufficient_funds: 0,
            exclusion_violations: 0,
            errors: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record a completed transfer and its end-to-end latency.
    pub fn record_success(&mut self, latency_ms: u64) {
        self.total_transfers += 1;
        self.completed_transfers += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_ms);
    }

    pub fn record_denial(&mut self, reason: &str) {
        self.total_transfers += 1;
        *self.denials.entry(reason.to_string()).or_default() += 1;
    }

    pub fn record_timeout(&mut self) {
        self.total_transfers += 1;
        self.timeouts += 1;
    }

    pub fn record_insufficient_funds(&mut self) {
        self.total_transfers += 1;
        self.insufficient_funds += 1;
    }

    pub fn record_violation(&mut self) {
        self.total_transfers += 1;
        self.exclusion_violations += 1;
    }

    pub fn record_error(&mut self) {
        self.total_transfers += 1;
        self.errors += 1;
    }

    /// Total permanent denials.
    pub fn denied(&self) -> u64 {
        self.denials.values().sum()
    }

    /// Get average latency in ms.
    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_ms(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Share of attempts that completed.
    pub fn success_rate(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }

        self.completed_transfers as f64 / self.total_transfers as f64
    }

    /// Completed transfers per second.
    pub fn throughput(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }

        self.completed_transfers as f64 / duration_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
