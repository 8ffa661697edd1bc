//! End-to-end lock coordination scenarios against an in-process coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc::error::TryRecvError;

use banklock_common::{BankLockError, Priority, RequestId, ResourceKey, WorkerId};
use banklock_coordinator::{ConnectionId, Coordinator, CoordinatorConfig};
use banklock_protocol::{
    auth_errors, reasons, ClientMessage, Heartbeat, LockReleaseMessage, LockRequestMessage,
    RegisterWorker, ServerMessage, WorkerStatus,
};

type Outbound = tokio::sync::mpsc::UnboundedReceiver<ServerMessage>;

struct Worker {
    id: WorkerId,
    conn: ConnectionId,
    rx: Outbound,
}

impl Worker {
    fn next(&mut self) -> ServerMessage {
        self.rx.try_recv().expect("expected a message")
    }

    fn assert_silent(&mut self) {
        assert!(matches!(self.rx.try_recv(), Err(TryRecvError::Empty)));
    }
}

async fn coordinator() -> Arc<Coordinator> {
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()).unwrap());
    coordinator.start().await.unwrap();
    coordinator
}

fn register(c: &Coordinator, worker: &str, capacity: usize, now: DateTime<Utc>) -> Worker {
    let (conn, rx) = c.open_connection();
    let id = WorkerId::new(worker);
    let token = c.issue_token(&id).token;
    c.handle_message_at(
        conn,
        ClientMessage::RegisterWorker(RegisterWorker {
            worker_id: id.clone(),
            listen_port: 3001,
            capacity,
            token: Some(token),
        }),
        now,
    )
    .unwrap();

    let mut worker = Worker { id, conn, rx };
    assert!(matches!(worker.next(), ServerMessage::WorkerRegistered(_)));
    worker
}

fn request(
    c: &Coordinator,
    worker: &Worker,
    request_id: &str,
    keys: &[&str],
    priority: Priority,
    now: DateTime<Utc>,
) {
    c.handle_message_at(
        worker.conn,
        ClientMessage::LockRequest(LockRequestMessage {
            request_id: RequestId::new(request_id),
            worker_id: worker.id.clone(),
            resources: keys.iter().map(|k| ResourceKey::account(*k)).collect(),
            priority,
            timeout_ms: Some(10_000),
            operation: "transfer".to_string(),
        }),
        now,
    )
    .unwrap();
}

fn release(c: &Coordinator, worker: &Worker, request_id: &str, keys: &[&str], now: DateTime<Utc>) {
    c.handle_message_at(
        worker.conn,
        ClientMessage::LockRelease(LockReleaseMessage {
            request_id: RequestId::new(request_id),
            worker_id: worker.id.clone(),
            resources: keys.iter().map(|k| ResourceKey::account(*k)).collect(),
        }),
        now,
    )
    .unwrap();
}

fn heartbeat(c: &Coordinator, worker: &Worker, now: DateTime<Utc>) {
    c.handle_message_at(
        worker.conn,
        ClientMessage::Heartbeat(Heartbeat {
            worker_id: worker.id.clone(),
            status: WorkerStatus::Idle,
            active_locks: 0,
        }),
        now,
    )
    .unwrap();
}

fn expect_granted(worker: &mut Worker, request_id: &str) -> i64 {
    match worker.next() {
        ServerMessage::LockGranted(g) => {
            assert_eq!(g.request_id, RequestId::new(request_id));
            g.expires_at
        }
        other => panic!("expected LOCK_GRANTED for {}, got {:?}", request_id, other),
    }
}

fn expect_denied(worker: &mut Worker, request_id: &str, reason: &str) {
    match worker.next() {
        ServerMessage::LockDenied(d) => {
            assert_eq!(d.request_id, RequestId::new(request_id));
            assert_eq!(d.razon, reason);
        }
        other => panic!("expected LOCK_DENIED({}) for {}, got {:?}", reason, request_id, other),
    }
}

/// Tracked lock counts must match the grants in the table.
fn assert_counts_consistent(c: &Coordinator) {
    let stats = c.stats();
    let mut grants: HashMap<WorkerId, std::collections::HashSet<RequestId>> = HashMap::new();
    for lock in &stats.locks {
        grants
            .entry(lock.worker_id.clone())
            .or_default()
            .insert(lock.request_id.clone());
    }
    for worker in &stats.workers {
        let held = grants.get(&worker.worker_id).map(|g| g.len()).unwrap_or(0);
        assert_eq!(worker.active_lock_count, held, "count drift for {}", worker.worker_id);
    }
}

#[tokio::test]
async fn immediate_grant_for_free_resource() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    let expires_at = expect_granted(&mut a, "a-1");
    assert_eq!(expires_at, (now + Duration::milliseconds(10_000)).timestamp_millis());

    let stats = c.stats();
    assert_eq!(stats.active_locks, 1);
    assert_eq!(stats.workers[0].active_lock_count, 1);
    assert_eq!(stats.workers[0].status, WorkerStatus::Busy);
}

#[tokio::test]
async fn queued_request_is_granted_after_release() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);
    let mut b = register(&c, "B", 5, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");

    request(&c, &b, "b-1", &["acc-1"], Priority::Normal, now);
    match b.next() {
        ServerMessage::LockDenied(d) => {
            assert_eq!(d.razon, reasons::QUEUED);
            assert_eq!(d.blocked_by, Some(WorkerId::new("A")));
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(c.stats().queue_depth, 1);

    release(&c, &a, "a-1", &["acc-1"], now);
    expect_granted(&mut b, "b-1");
    a.assert_silent();

    let stats = c.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.locks[0].worker_id, WorkerId::new("B"));
    assert_counts_consistent(&c);
}

#[tokio::test]
async fn releasing_unheld_resource_is_noop() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");
    release(&c, &a, "a-9", &["acc-9"], now);

    assert_eq!(c.stats().active_locks, 1);
    assert_counts_consistent(&c);
}

#[tokio::test]
async fn deadlock_victim_is_latest_arrival_on_equal_priority() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);
    let mut b = register(&c, "B", 5, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");
    request(&c, &b, "b-1", &["acc-2"], Priority::Normal, now);
    expect_granted(&mut b, "b-1");

    // Each now waits for the other's hold.
    request(&c, &a, "a-2", &["acc-2"], Priority::Normal, now);
    expect_denied(&mut a, "a-2", reasons::QUEUED);
    request(&c, &b, "b-2", &["acc-1"], Priority::Normal, now + Duration::milliseconds(5));
    expect_denied(&mut b, "b-2", reasons::QUEUED);

    let evaluation = c.evaluate_queue_at(now + Duration::milliseconds(10));
    assert_eq!(evaluation.victim, Some(RequestId::new("b-2")));
    expect_denied(&mut b, "b-2", reasons::DEADLOCK_VICTIM);
    a.assert_silent();

    let stats = c.stats();
    assert_eq!(stats.deadlock.cycles_detected, 1);
    assert_eq!(stats.deadlock.victims_selected, 1);
    assert_eq!(stats.counters.deadlocks_resolved, 1);
    assert_eq!(stats.queue_depth, 1);

    // The victim backs off and releases what it holds.
    release(&c, &b, "b-1", &["acc-2"], now + Duration::milliseconds(20));
    expect_granted(&mut a, "a-2");
    assert_counts_consistent(&c);
}

#[tokio::test]
async fn deadlock_victim_is_lower_priority() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);
    let mut b = register(&c, "B", 5, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");
    request(&c, &b, "b-1", &["acc-2"], Priority::Normal, now);
    expect_granted(&mut b, "b-1");

    request(&c, &a, "a-2", &["acc-2"], Priority::Low, now);
    expect_denied(&mut a, "a-2", reasons::QUEUED);
    request(&c, &b, "b-2", &["acc-1"], Priority::Critical, now + Duration::milliseconds(5));
    expect_denied(&mut b, "b-2", reasons::QUEUED);

    let evaluation = c.evaluate_queue_at(now + Duration::milliseconds(10));
    assert_eq!(evaluation.victim, Some(RequestId::new("a-2")));
    expect_denied(&mut a, "a-2", reasons::DEADLOCK_VICTIM);
    b.assert_silent();
}

#[tokio::test]
async fn deadlock_victim_comes_from_cycle_edges_only() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);
    let mut b = register(&c, "B", 5, now);
    let mut w_c = register(&c, "C", 5, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");
    request(&c, &b, "b-1", &["acc-2"], Priority::Normal, now);
    expect_granted(&mut b, "b-1");
    request(&c, &w_c, "c-1", &["acc-3"], Priority::Normal, now);
    expect_granted(&mut w_c, "c-1");

    // B also waits on C, outside the A/B cycle, at the lowest priority.
    request(&c, &b, "b-3", &["acc-3"], Priority::Low, now);
    expect_denied(&mut b, "b-3", reasons::QUEUED);
    request(&c, &a, "a-2", &["acc-2"], Priority::Normal, now);
    expect_denied(&mut a, "a-2", reasons::QUEUED);
    request(&c, &b, "b-2", &["acc-1"], Priority::Normal, now + Duration::milliseconds(5));
    expect_denied(&mut b, "b-2", reasons::QUEUED);

    let evaluation = c.evaluate_queue_at(now + Duration::milliseconds(10));
    assert_eq!(evaluation.victim, Some(RequestId::new("b-2")));
    expect_denied(&mut b, "b-2", reasons::DEADLOCK_VICTIM);
    b.assert_silent();

    let queued: Vec<RequestId> = c.stats().queue.iter().map(|q| q.request_id.clone()).collect();
    assert_eq!(queued.len(), 2);
    assert!(queued.contains(&RequestId::new("a-2")));
    assert!(queued.contains(&RequestId::new("b-3")));

    // One victim breaks the cycle.
    let evaluation = c.evaluate_queue_at(now + Duration::milliseconds(20));
    assert_eq!(evaluation.victim, None);
    assert!(evaluation.denied.is_empty());
    b.assert_silent();
    a.assert_silent();

    let stats = c.stats();
    assert_eq!(stats.deadlock.victims_selected, 1);
    assert_eq!(stats.counters.deadlocks_resolved, 1);
    assert_eq!(stats.queue_depth, 2);
}

#[tokio::test]
async fn silent_worker_is_evicted_and_waiter_granted() {
    let c = coordinator().await;
    let t0 = Utc::now();
    let mut w_c = register(&c, "C", 5, t0);
    let mut w_d = register(&c, "D", 5, t0);

    request(&c, &w_c, "c-1", &["acc-5"], Priority::Normal, t0);
    expect_granted(&mut w_c, "c-1");
    request(&c, &w_c, "c-2", &["acc-6"], Priority::Normal, t0);
    expect_granted(&mut w_c, "c-2");
    request(&c, &w_d, "d-1", &["acc-5"], Priority::Normal, t0);
    expect_denied(&mut w_d, "d-1", reasons::QUEUED);

    heartbeat(&c, &w_d, t0 + Duration::seconds(10));
    let report = c.run_maintenance(t0 + Duration::seconds(16));

    assert_eq!(report.evicted, vec![WorkerId::new("C")]);
    expect_granted(&mut w_d, "d-1");
    assert!(matches!(w_c.rx.try_recv(), Err(TryRecvError::Disconnected)));

    let stats = c.stats();
    assert_eq!(stats.active_workers, 1);
    assert_eq!(stats.active_locks, 1);
    assert_eq!(stats.counters.workers_evicted, 1);
    assert_counts_consistent(&c);
}

#[tokio::test]
async fn disconnect_releases_locks_and_purges_queue() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);
    let mut b = register(&c, "B", 5, now);
    let mut other = register(&c, "X", 5, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");
    request(&c, &other, "x-1", &["acc-2"], Priority::Normal, now);
    expect_granted(&mut other, "x-1");
    request(&c, &a, "a-2", &["acc-2"], Priority::Normal, now);
    expect_denied(&mut a, "a-2", reasons::QUEUED);
    request(&c, &b, "b-1", &["acc-1"], Priority::Normal, now);
    expect_denied(&mut b, "b-1", reasons::QUEUED);

    c.handle_disconnect_at(a.conn, now);
    expect_granted(&mut b, "b-1");

    let stats = c.stats();
    assert_eq!(stats.queue_depth, 0);
    assert!(stats.workers.iter().all(|w| w.worker_id != WorkerId::new("A")));
    assert_counts_consistent(&c);
}

#[tokio::test]
async fn repeated_request_exhausts_retry_limit() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut holder = register(&c, "H", 5, now);
    let mut e = register(&c, "E", 5, now);

    request(&c, &holder, "h-1", &["acc-7"], Priority::Normal, now);
    expect_granted(&mut holder, "h-1");

    request(&c, &e, "e-1", &["acc-7"], Priority::Normal, now);
    expect_denied(&mut e, "e-1", reasons::QUEUED);

    // Ten re-queues are tolerated; the eleventh is the limit.
    for _ in 0..10 {
        request(&c, &e, "e-1", &["acc-7"], Priority::Normal, now);
        expect_denied(&mut e, "e-1", reasons::QUEUED);
    }
    assert_eq!(c.stats().queue[0].retry_count, 10);

    request(&c, &e, "e-1", &["acc-7"], Priority::Normal, now);
    expect_denied(&mut e, "e-1", reasons::RETRY_LIMIT);

    let stats = c.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.queue_metrics.denied_by_retry_exhaustion, 1);
    assert_eq!(stats.counters.requests_denied, 1);
}

#[tokio::test]
async fn occupied_resource_exhausts_retries_during_evaluation() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut holder = register(&c, "H", 5, now);
    let mut e = register(&c, "E", 5, now);

    request(&c, &holder, "h-1", &["acc-7"], Priority::Normal, now);
    expect_granted(&mut holder, "h-1");
    request(&c, &e, "e-1", &["acc-7"], Priority::Normal, now);
    expect_denied(&mut e, "e-1", reasons::QUEUED);

    for pass in 1..=10 {
        let evaluation = c.evaluate_queue_at(now + Duration::seconds(pass));
        assert!(evaluation.denied.is_empty());
        assert_eq!(c.stats().queue[0].retry_count as i64, pass);
    }
    let evaluation = c.evaluate_queue_at(now + Duration::seconds(11));
    assert_eq!(evaluation.denied, vec![RequestId::new("e-1")]);
    expect_denied(&mut e, "e-1", reasons::RETRY_LIMIT_OCCUPIED);
    assert_eq!(c.stats().deadlock.wait_edges, 0);
}

#[tokio::test]
async fn bad_token_is_rejected_and_worker_stays_unauthenticated() {
    let c = coordinator().await;
    let (conn, mut rx) = c.open_connection();

    let result = c.handle_message(
        conn,
        ClientMessage::RegisterWorker(RegisterWorker {
            worker_id: WorkerId::new("X"),
            listen_port: 3001,
            capacity: 5,
            token: Some("X.99999999999999.00ff".to_string()),
        }),
    );
    assert!(matches!(result, Err(BankLockError::AuthenticationFailed { .. })));

    match rx.try_recv() {
        Ok(ServerMessage::AuthError(e)) => assert_eq!(e.error, auth_errors::INVALID_TOKEN),
        other => panic!("unexpected: {:?}", other),
    }
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    assert_eq!(c.stats().active_workers, 0);

    let (other, mut other_rx) = c.open_connection();
    let result = c.handle_message(
        other,
        ClientMessage::LockRequest(LockRequestMessage {
            request_id: RequestId::new("x-1"),
            worker_id: WorkerId::new("X"),
            resources: vec![ResourceKey::account("acc-1")],
            priority: Priority::Normal,
            timeout_ms: None,
            operation: String::new(),
        }),
    );
    assert!(matches!(result, Err(BankLockError::NotAuthenticated(_))));
    match other_rx.try_recv() {
        Ok(ServerMessage::AuthError(e)) => {
            assert_eq!(e.error, auth_errors::NOT_AUTHENTICATED);
            assert_eq!(e.request_id, Some(RequestId::new("x-1")));
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(c.stats().queue_depth, 0);
    assert_eq!(c.stats().counters.auth_failures, 2);
}

#[tokio::test]
async fn reregistration_replaces_record_and_purges_state() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut first = register(&c, "A", 5, now);
    let mut b = register(&c, "B", 5, now);

    request(&c, &first, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut first, "a-1");
    request(&c, &b, "b-1", &["acc-1"], Priority::Normal, now);
    expect_denied(&mut b, "b-1", reasons::QUEUED);

    let second = register(&c, "A", 5, now);
    assert!(matches!(first.rx.try_recv(), Err(TryRecvError::Disconnected)));
    expect_granted(&mut b, "b-1");

    let stats = c.stats();
    assert_eq!(stats.active_workers, 2);
    let a = stats.workers.iter().find(|w| w.worker_id == second.id).unwrap();
    assert_eq!(a.active_lock_count, 0);
    assert_counts_consistent(&c);
}

#[tokio::test]
async fn status_request_returns_snapshot() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 5, now);

    c.handle_message(a.conn, ClientMessage::StatusRequest).unwrap();
    match a.next() {
        ServerMessage::StatusResponse(snapshot) => {
            assert_eq!(snapshot.state, "running");
            assert_eq!(snapshot.active_workers, 1);
        }
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn capacity_blocked_entry_waits_then_is_granted() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 1, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");
    request(&c, &a, "a-2", &["acc-2"], Priority::Normal, now);
    a.assert_silent();

    // acc-2 is free, but A is still at its declared capacity.
    for pass in 1..=3 {
        let evaluation = c.evaluate_queue_at(now + Duration::seconds(pass));
        assert!(evaluation.granted.is_empty());
        assert!(evaluation.denied.is_empty());
        a.assert_silent();
        let stats = c.stats();
        assert_eq!(stats.queue_depth, 1);
        assert_eq!(stats.queue[0].retry_count as i64, pass);
    }
    assert_eq!(c.stats().deadlock.wait_edges, 0);

    release(&c, &a, "a-1", &["acc-1"], now + Duration::seconds(4));
    expect_granted(&mut a, "a-2");

    let stats = c.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.workers[0].active_lock_count, 1);
    assert_counts_consistent(&c);
}

#[tokio::test]
async fn capacity_blocked_entry_exhausts_retry_limit() {
    let c = coordinator().await;
    let now = Utc::now();
    let mut a = register(&c, "A", 1, now);

    request(&c, &a, "a-1", &["acc-1"], Priority::Normal, now);
    expect_granted(&mut a, "a-1");
    request(&c, &a, "a-2", &["acc-2"], Priority::Normal, now);
    a.assert_silent();

    for pass in 1..=10 {
        let evaluation = c.evaluate_queue_at(now + Duration::seconds(pass));
        assert!(evaluation.denied.is_empty());
    }
    assert_eq!(c.stats().queue[0].retry_count, 10);

    let evaluation = c.evaluate_queue_at(now + Duration::seconds(11));
    assert_eq!(evaluation.denied, vec![RequestId::new("a-2")]);
    expect_denied(&mut a, "a-2", reasons::RETRY_LIMIT);

    let stats = c.stats();
    assert_eq!(stats.queue_depth, 0);
    assert_eq!(stats.queue_metrics.denied_by_retry_exhaustion, 1);
    assert_eq!(stats.active_locks, 1);
    assert_counts_consistent(&c);
}
