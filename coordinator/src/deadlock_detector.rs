//! Wait-for graph and cycle detection.
//!
//! Edges are evidence gathered while scanning the queue: "worker A is waiting
//! for a key held by worker B". They are refreshed on every scan and
//! discarded once stale.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use banklock_common::{RequestId, ResourceKey, StdDurationExt, WorkerId};
use banklock_protocol::DeadlockStats;

use crate::wait_queue::QueueEntry;

/// One worker blocked on a key held by another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitForEdge {
    pub waiting: WorkerId,
    pub holding: WorkerId,
    pub resource: ResourceKey,
    /// Queued request that is blocked.
    pub request_id: RequestId,
    pub recorded_at: DateTime<Utc>,
}

/// Workers waiting on each other in a ring, and the queued requests whose
/// edges close it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitCycle {
    pub workers: Vec<WorkerId>,
    pub requests: BTreeSet<RequestId>,
}

impl WaitCycle {
    /// Whether `edge` runs from one cycle member to the next.
    fn carries(&self, edge: &WaitForEdge) -> bool {
        match self.workers.iter().position(|w| w == &edge.waiting) {
            Some(i) => self.workers[(i + 1) % self.workers.len()] == edge.holding,
            None => false,
        }
    }
}

/// Wait-for graph over workers.
#[derive(Debug, Default)]
pub struct DeadlockDetector {
    edges: Vec<WaitForEdge>,
    cycles_detected: u64,
    victims_selected: u64,
    stale_edges_pruned: u64,
}

impl DeadlockDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh an edge. Self-waits are ignored.
    pub fn record_wait(
        &mut self,
        waiting: &WorkerId,
        holding: &WorkerId,
        resource: &ResourceKey,
        request_id: &RequestId,
        now: DateTime<Utc>,
    ) {
        if waiting == holding {
            return;
        }

        if let Some(edge) = self.edges.iter_mut().find(|e| {
            &e.waiting == waiting && &e.holding == holding && &e.resource == resource && &e.request_id == request_id
        }) {
            edge.recorded_at = now;
            return;
        }

        debug!(waiting = %waiting, holding = %holding, resource = %resource, "Wait edge recorded");
        self.edges.push(WaitForEdge {
            waiting: waiting.clone(),
            holding: holding.clone(),
            resource: resource.clone(),
            request_id: request_id.clone(),
            recorded_at: now,
        });
    }

    /// Remove every edge where `worker_id` is the waiter.
    pub fn clear_wait(&mut self, worker_id: &WorkerId) {
        self.edges.retain(|e| &e.waiting != worker_id);
    }

    /// Remove the edges recorded for one queued request.
    pub fn clear_request(&mut self, request_id: &RequestId) {
        self.edges.retain(|e| &e.request_id != request_id);
    }

    /// Remove every edge touching `worker_id` in either direction.
    pub fn forget_worker(&mut self, worker_id: &WorkerId) {
        self.edges
            .retain(|e| &e.waiting != worker_id && &e.holding != worker_id);
    }

    /// Find a cycle of mutually waiting workers.
    ///
    /// The traversal visits workers in id order, so the same graph always
    /// yields the same cycle.
    pub fn detect_cycle(&mut self) -> Option<WaitCycle> {
        let mut graph: BTreeMap<&WorkerId, BTreeSet<&WorkerId>> = BTreeMap::new();
        for edge in &self.edges {
            graph.entry(&edge.waiting).or_default().insert(&edge.holding);
        }

        let mut done: BTreeSet<&WorkerId> = BTreeSet::new();
        let mut workers = None;

        for &start in graph.keys() {
            if done.contains(start) {
                continue;
            }
            let mut path: Vec<&WorkerId> = Vec::new();
            if let Some(found) = visit(start, &graph, &mut path, &mut done) {
                workers = Some(found.into_iter().cloned().collect::<Vec<_>>());
                break;
            }
        }

        let mut cycle = WaitCycle {
            workers: workers?,
            requests: BTreeSet::new(),
        };
        let requests: BTreeSet<RequestId> = self
            .edges
            .iter()
            .filter(|e| cycle.carries(e))
            .map(|e| e.request_id.clone())
            .collect();
        cycle.requests = requests;

        self.cycles_detected += 1;
        warn!(
            workers = ?cycle.workers.iter().map(WorkerId::as_str).collect::<Vec<_>>(),
            requests = ?cycle.requests.iter().map(RequestId::as_str).collect::<Vec<_>>(),
            "Deadlock detected"
        );
        Some(cycle)
    }

    /// Pick the queued request to abort: lowest priority among the requests
    /// on the cycle's edges, ties going to the most recent arrival. Other
    /// requests of the same workers are never chosen.
    pub fn select_victim<'a, I>(&mut self, cycle: &WaitCycle, queue: I) -> Option<&'a QueueEntry>
    where
        I: IntoIterator<Item = &'a QueueEntry>,
    {
        let victim = queue
            .into_iter()
            .filter(|entry| cycle.requests.contains(entry.request_id()))
            .min_by(|a, b| {
                a.request
                    .priority
                    .cmp(&b.request.priority)
                    .then(b.arrival.cmp(&a.arrival))
                    .then(b.sequence.cmp(&a.sequence))
            })?;

        self.victims_selected += 1;
        info!(
            request_id = %victim.request_id(),
            worker_id = %victim.worker_id(),
            priority = %victim.request.priority,
            "Deadlock victim selected"
        );
        Some(victim)
    }

    /// Drop the victim request's wait edges. Edges of the worker's other
    /// queued requests still describe real waits and stay.
    pub fn resolve(&mut self, victim: &QueueEntry) {
        self.clear_request(victim.request_id());
    }

    /// Discard edges older than `max_age`.
    pub fn prune_stale_edges(&mut self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age = max_age.to_chrono();
        let before = self.edges.len();
        self.edges.retain(|e| now - e.recorded_at <= max_age);
        let pruned = before - self.edges.len();
        if pruned > 0 {
            self.stale_edges_pruned += pruned as u64;
            debug!(pruned, "Stale wait edges pruned");
        }
        pruned
    }

    pub fn edges(&self) -> &[WaitForEdge] {
        &self.edges
    }

    pub fn stats(&self) -> DeadlockStats {
        DeadlockStats {
            wait_edges: self.edges.len(),
            cycles_detected: self.cycles_detected,
            victims_selected: self.victims_selected,
            stale_edges_pruned: self.stale_edges_pruned,
        }
    }
}

/// Depth-first search returning the first back edge's cycle.
fn visit<'g>(
    node: &'g WorkerId,
    graph: &BTreeMap<&'g WorkerId, BTreeSet<&'g WorkerId>>,
    path: &mut Vec<&'g WorkerId>,
    done: &mut BTreeSet<&'g WorkerId>,
) -> Option<Vec<&'g WorkerId>> {
    if let Some(position) = path.iter().position(|&n| n == node) {
        return Some(path[position..].to_vec());
    }
    if done.contains(node) {
        return None;
    }

    path.push(node);
    if let Some(next) = graph.get(node) {
        for &neighbour in next {
            if let Some(cycle) = visit(neighbour, graph, path, done) {
                return Some(cycle);
            }
        }
    }
    path.pop();
    done.insert(node);
    None
}
