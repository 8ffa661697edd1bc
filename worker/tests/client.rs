//! Worker client against a coordinator served on a loopback port.

use std::sync::Arc;
use std::time::Duration;

use banklock_common::{BankLockError, Priority, ResourceKey, WorkerId};
use banklock_coordinator::server::router;
use banklock_coordinator::{Coordinator, CoordinatorConfig};
use banklock_worker::{WorkerClient, WorkerClientBuilder, WorkerConfig};

async fn spawn_coordinator() -> (Arc<Coordinator>, String) {
    let coordinator = Arc::new(Coordinator::new(CoordinatorConfig::default()).unwrap());
    coordinator.start().await.unwrap();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(coordinator.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (coordinator, format!("ws://{}/ws", addr))
}

fn config(coordinator: &Coordinator, url: &str, worker: &str) -> WorkerConfig {
    let worker_id = WorkerId::new(worker);
    WorkerConfig {
        coordinator_url: url.to_string(),
        token: Some(coordinator.issue_token(&worker_id).token),
        worker_id,
        ..WorkerConfig::default()
    }
}

async fn connected(coordinator: &Coordinator, url: &str, worker: &str) -> WorkerClient {
    let client = WorkerClientBuilder::new()
        .config(config(coordinator, url, worker))
        .build()
        .unwrap();
    client.connect().await.unwrap();
    client
}

/// Poll until `condition` holds or a second passes.
async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn acquire_and_release() {
    let (coordinator, url) = spawn_coordinator().await;
    let client = connected(&coordinator, &url, "teller-1").await;
    assert!(client.is_connected().await);

    let handle = client
        .acquire(
            [ResourceKey::account("acc-2"), ResourceKey::account("acc-1")],
            Priority::Normal,
            "transfer",
        )
        .await
        .unwrap();
    assert_eq!(
        handle.resources,
        vec![ResourceKey::account("acc-1"), ResourceKey::account("acc-2")]
    );
    assert_eq!(client.active_lock_count(), 1);
    assert_eq!(coordinator.stats().locks.len(), 2);

    client.release(handle).await.unwrap();
    eventually(|| coordinator.stats().active_locks == 0).await;
    assert_eq!(client.active_lock_count(), 0);
}

#[tokio::test]
async fn queued_acquire_waits_for_release() {
    let (coordinator, url) = spawn_coordinator().await;
    let first = connected(&coordinator, &url, "teller-1").await;
    let second = Arc::new(connected(&coordinator, &url, "teller-2").await);

    let held = first
        .acquire([ResourceKey::account("acc-1")], Priority::Normal, "withdrawal")
        .await
        .unwrap();

    let waiter = {
        let second = second.clone();
        tokio::spawn(async move {
            second
                .acquire([ResourceKey::account("acc-1")], Priority::Normal, "deposit")
                .await
        })
    };
    eventually(|| coordinator.stats().queue_depth == 1).await;

    first.release(held).await.unwrap();
    let granted = waiter.await.unwrap().unwrap();
    assert_eq!(granted.resources, vec![ResourceKey::account("acc-1")]);
}

#[tokio::test]
async fn acquire_timeout_cancels_queued_request() {
    let (coordinator, url) = spawn_coordinator().await;
    let holder = connected(&coordinator, &url, "teller-1").await;
    let impatient = WorkerClientBuilder::new()
        .config(WorkerConfig {
            acquire_timeout: Duration::from_millis(200),
            ..config(&coordinator, &url, "teller-2")
        })
        .build()
        .unwrap();
    impatient.connect().await.unwrap();

    let _held = holder
        .acquire([ResourceKey::card("card-1")], Priority::Normal, "card-payment")
        .await
        .unwrap();

    let err = impatient
        .acquire([ResourceKey::card("card-1")], Priority::Normal, "card-payment")
        .await
        .unwrap_err();
    assert!(matches!(err, BankLockError::LockTimeout { .. }));

    eventually(|| coordinator.stats().queue_depth == 0).await;
    assert_eq!(coordinator.stats().counters.requests_cancelled, 1);
}

#[tokio::test]
async fn with_locks_releases_after_failed_work() {
    let (coordinator, url) = spawn_coordinator().await;
    let client = connected(&coordinator, &url, "teller-1").await;

    let outcome: banklock_common::Result<()> = client
        .with_locks(
            [ResourceKey::account("acc-1"), ResourceKey::account("acc-9")],
            Priority::High,
            "transfer",
            || async {
                Err(BankLockError::InternalError("insufficient funds".to_string()))
            },
        )
        .await;

    assert!(matches!(outcome, Err(BankLockError::InternalError(_))));
    eventually(|| coordinator.stats().active_locks == 0).await;
}

#[tokio::test]
async fn bad_token_fails_registration() {
    let (coordinator, url) = spawn_coordinator().await;
    let client = WorkerClientBuilder::new()
        .coordinator_url(url)
        .worker_id("teller-1")
        .token("teller-1.1.00")
        .build()
        .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, BankLockError::AuthenticationFailed { .. }));
    assert!(!client.is_connected().await);
    assert_eq!(coordinator.stats().active_workers, 0);
}

#[tokio::test]
async fn status_returns_snapshot() {
    let (coordinator, url) = spawn_coordinator().await;
    let client = connected(&coordinator, &url, "teller-1").await;

    let snapshot = client.status().await.unwrap();
    assert_eq!(snapshot.active_workers, 1);
    assert_eq!(snapshot.workers[0].worker_id, WorkerId::new("teller-1"));
}

#[tokio::test]
async fn disconnect_releases_held_locks() {
    let (coordinator, url) = spawn_coordinator().await;
    let client = connected(&coordinator, &url, "teller-1").await;

    let _handle = client
        .acquire([ResourceKey::account("acc-1")], Priority::Normal, "transfer")
        .await
        .unwrap();
    client.disconnect().await.unwrap();

    eventually(|| coordinator.stats().active_workers == 0).await;
    assert_eq!(coordinator.stats().active_locks, 0);
}
