//! Worker client for acquiring bank resource locks.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use banklock_common::{from_epoch_millis, BankLockError, Priority, RequestId, ResourceKey, Result};
use banklock_protocol::{
    reasons, CancelRequest, ClientMessage, Heartbeat, LockReleaseMessage, LockRequestMessage,
    RegisterWorker, ServerMessage, StatusSnapshot, WorkerStatus,
};

use crate::config::WorkerConfig;
use crate::connection::{CoordinatorConnection, EventReceiver, ReplyReceiver};
use crate::handler::{CoordinatorEvent, CoordinatorEventHandler, LoggingHandler};

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub request_id: RequestId,
    /// Locked keys in canonical order.
    pub resources: Vec<ResourceKey>,
    pub expires_at: DateTime<Utc>,
}

/// Client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected.
    Disconnected,
    /// Connecting and registering.
    Connecting,
    /// Registered and operational.
    Connected,
}

type ConnectionSlot = Arc<RwLock<Option<Arc<CoordinatorConnection>>>>;

/// Client used by a teller process to lock accounts and cards.
pub struct WorkerClient {
    /// Configuration.
    config: WorkerConfig,
    /// Current state.
    state: Arc<RwLock<ClientState>>,
    /// Connection to coordinator.
    connection: ConnectionSlot,
    /// Grants currently held, by request id.
    held: Arc<DashMap<RequestId, Vec<ResourceKey>>>,
    /// Handler for unsolicited events.
    handler: Arc<dyn CoordinatorEventHandler>,
    /// Stops the heartbeat loop.
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerClient {
    /// Create a new worker client.
    pub fn new(config: WorkerConfig, handler: Arc<dyn CoordinatorEventHandler>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            connection: Arc::new(RwLock::new(None)),
            held: Arc::new(DashMap::new()),
            handler,
            shutdown_tx,
        }
    }

    /// Connect to the coordinator and register.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn connect(&self) -> Result<()> {
        info!(coordinator_url = %self.config.coordinator_url, "Connecting to coordinator");

        *self.state.write().await = ClientState::Connecting;

        let registered = self.open_and_register().await;
        let (connection, events) = match registered {
            Ok(opened) => opened,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(e);
            }
        };

        let connection = Arc::new(connection);
        *self.connection.write().await = Some(connection.clone());
        *self.state.write().await = ClientState::Connected;
        self.shutdown_tx.send_replace(false);

        info!(capacity = self.config.capacity, "Registered with coordinator");

        self.start_heartbeat_loop(connection.clone());
        self.start_event_loop(connection, events);

        Ok(())
    }

    /// Disconnect from the coordinator. The coordinator releases every lock
    /// still held.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting");

        self.shutdown_tx.send_replace(true);

        if let Some(connection) = self.connection.write().await.take() {
            connection.close();
        }
        self.held.clear();

        *self.state.write().await = ClientState::Disconnected;

        info!("Disconnected");
        Ok(())
    }

    /// Lock every key in `resources`, waiting while the request is queued.
    ///
    /// Keys are requested in canonical order. Gives up after the configured
    /// acquire timeout, cancelling the queued request.
    #[instrument(skip(self, resources), fields(worker_id = %self.config.worker_id))]
    pub async fn acquire<I>(&self, resources: I, priority: Priority, operation: &str) -> Result<LockHandle>
    where
        I: IntoIterator<Item = ResourceKey>,
    {
        let resources = canonical_order(resources);
        if resources.is_empty() {
            return Err(BankLockError::InvalidMessage {
                message: "at least one resource is required".to_string(),
                field: Some("recursos".to_string()),
            });
        }

        let connection = self.current_connection().await?;
        let request_id = RequestId::generate();
        let mut replies = connection.subscribe(&request_id);

        let outcome = self
            .await_grant(&connection, &request_id, resources, priority, operation, &mut replies)
            .await;

        connection.unsubscribe(&request_id);
        if outcome.is_err() {
            // A grant that raced the timeout is still ours to give back.
            while let Ok(reply) = replies.try_recv() {
                if let ServerMessage::LockGranted(grant) = reply {
                    send_release(&connection, &grant.worker_id, grant.request_id, grant.resources);
                }
            }
        }
        outcome
    }

    /// Release a granted lock.
    #[instrument(skip(self, handle), fields(worker_id = %self.config.worker_id, request_id = %handle.request_id))]
    pub async fn release(&self, handle: LockHandle) -> Result<()> {
        self.held.remove(&handle.request_id);
        let connection = self.current_connection().await?;
        connection.send(&ClientMessage::LockRelease(LockReleaseMessage {
            request_id: handle.request_id,
            worker_id: self.config.worker_id.clone(),
            resources: handle.resources,
        }))
    }

    /// Run `work` while holding `resources`. The locks are released whether
    /// or not `work` succeeds.
    pub async fn with_locks<I, F, Fut, T>(
        &self,
        resources: I,
        priority: Priority,
        operation: &str,
        work: F,
    ) -> Result<T>
    where
        I: IntoIterator<Item = ResourceKey>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let handle = self.acquire(resources, priority, operation).await?;
        let request_id = handle.request_id.clone();

        let outcome = work().await;
        let released = self.release(handle).await;
        if let Err(e) = &released {
            warn!(request_id = %request_id, error = %e, "Release after critical section failed");
        }

        let value = outcome?;
        released?;
        Ok(value)
    }

    /// Ask the coordinator for its statistics snapshot.
    pub async fn status(&self) -> Result<StatusSnapshot> {
        let connection = self.current_connection().await?;
        let answer = connection.request_status()?;
        tokio::time::timeout(self.config.connection_timeout, answer)
            .await
            .map_err(|_| BankLockError::LockTimeout {
                operation: "status-request".to_string(),
            })?
            .map_err(|_| BankLockError::NetworkError("Connection closed".to_string()))
    }

    /// Get current client state.
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Check if connected.
    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ClientState::Connected
    }

    /// Number of grants currently held.
    pub fn active_lock_count(&self) -> usize {
        self.held.len()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    // --- Private methods ---

    async fn open_and_register(&self) -> Result<(CoordinatorConnection, EventReceiver)> {
        let timeout = self.config.connection_timeout;
        let (connection, mut events) =
            CoordinatorConnection::open(&self.config.coordinator_url, timeout).await?;

        connection.send(&ClientMessage::RegisterWorker(RegisterWorker {
            worker_id: self.config.worker_id.clone(),
            listen_port: self.config.listen_port,
            capacity: self.config.capacity,
            token: self.config.token.clone(),
        }))?;

        tokio::time::timeout(timeout, self.wait_for_registration(&mut events))
            .await
            .map_err(|_| BankLockError::LockTimeout {
                operation: "register".to_string(),
            })??;

        Ok((connection, events))
    }

    async fn wait_for_registration(&self, events: &mut EventReceiver) -> Result<()> {
        let worker_id = &self.config.worker_id;
        while let Some(message) = events.recv().await {
            match message {
                ServerMessage::WorkerRegistered(m) if &m.worker_id == worker_id => return Ok(()),
                ServerMessage::AuthError(e) => {
                    return Err(BankLockError::AuthenticationFailed {
                        worker_id: worker_id.clone(),
                        reason: e.error,
                    })
                }
                ServerMessage::ValidationError(e) => {
                    return Err(BankLockError::InvalidMessage {
                        message: e.error,
                        field: None,
                    })
                }
                other => debug!(event = other.event_name(), "Ignoring message during registration"),
            }
        }
        Err(BankLockError::NetworkError(
            "Connection closed during registration".to_string(),
        ))
    }

    async fn await_grant(
        &self,
        connection: &CoordinatorConnection,
        request_id: &RequestId,
        resources: Vec<ResourceKey>,
        priority: Priority,
        operation: &str,
        replies: &mut ReplyReceiver,
    ) -> Result<LockHandle> {
        connection.send(&ClientMessage::LockRequest(LockRequestMessage {
            request_id: request_id.clone(),
            worker_id: self.config.worker_id.clone(),
            resources: resources.clone(),
            priority,
            timeout_ms: self.config.lock_timeout.map(|t| t.as_millis() as u64),
            operation: operation.to_string(),
        }))?;

        let deadline = tokio::time::sleep(self.config.acquire_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                reply = replies.recv() => match reply {
                    Some(ServerMessage::LockGranted(grant)) => {
                        self.held.insert(grant.request_id.clone(), grant.resources.clone());
                        info!(request_id = %grant.request_id, keys = grant.resources.len(), "Lock acquired");
                        return Ok(LockHandle {
                            request_id: grant.request_id,
                            resources: grant.resources,
                            expires_at: from_epoch_millis(grant.expires_at).unwrap_or_else(Utc::now),
                        });
                    }
                    Some(ServerMessage::LockDenied(denied)) if reasons::is_advisory(&denied.razon) => {
                        debug!(
                            request_id = %request_id,
                            blocked_by = ?denied.blocked_by.as_ref().map(|w| w.as_str()),
                            "Request queued, waiting"
                        );
                    }
                    Some(ServerMessage::LockDenied(denied)) => {
                        info!(request_id = %request_id, reason = %denied.razon, "Lock denied");
                        return Err(BankLockError::LockDenied {
                            request_id: denied.request_id,
                            reason: denied.razon,
                        });
                    }
                    Some(ServerMessage::AuthError(_)) => {
                        return Err(BankLockError::NotAuthenticated(self.config.worker_id.clone()));
                    }
                    Some(other) => debug!(event = other.event_name(), "Unexpected reply"),
                    None => {
                        return Err(BankLockError::NetworkError(
                            "Connection closed while waiting for lock".to_string(),
                        ));
                    }
                },
                _ = &mut deadline => {
                    warn!(request_id = %request_id, operation, "Lock wait timed out, cancelling");
                    let cancel = ClientMessage::CancelRequest(CancelRequest {
                        request_id: request_id.clone(),
                        worker_id: self.config.worker_id.clone(),
                    });
                    if let Err(e) = connection.send(&cancel) {
                        debug!(error = %e, "Cancel not sent");
                    }
                    return Err(BankLockError::LockTimeout {
                        operation: operation.to_string(),
                    });
                }
            }
        }
    }

    async fn current_connection(&self) -> Result<Arc<CoordinatorConnection>> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| BankLockError::NetworkError("Not connected to coordinator".to_string()))
    }

    fn start_heartbeat_loop(&self, connection: Arc<CoordinatorConnection>) {
        let worker_id = self.config.worker_id.clone();
        let held = self.held.clone();
        let period = self.config.heartbeat_interval;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let active = held.len();
                        let heartbeat = ClientMessage::Heartbeat(Heartbeat {
                            worker_id: worker_id.clone(),
                            status: if active == 0 { WorkerStatus::Idle } else { WorkerStatus::Busy },
                            active_locks: active,
                        });
                        if let Err(e) = connection.send(&heartbeat) {
                            warn!(error = %e, "Heartbeat failed");
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
    }

    fn start_event_loop(&self, connection: Arc<CoordinatorConnection>, mut events: EventReceiver) {
        let slot = self.connection.clone();
        let state = self.state.clone();
        let held = self.held.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                let event = match message {
                    ServerMessage::ForceRelease(m) => {
                        held.remove(&m.request_id);
                        CoordinatorEvent::ForceRelease {
                            request_id: m.request_id,
                        }
                    }
                    ServerMessage::LockGranted(grant) => {
                        let request_id = grant.request_id.clone();
                        send_release(&connection, &grant.worker_id, grant.request_id, grant.resources);
                        CoordinatorEvent::LateGrant { request_id }
                    }
                    ServerMessage::ValidationError(e) => CoordinatorEvent::ValidationError {
                        tipo: e.tipo,
                        error: e.error,
                    },
                    ServerMessage::AuthError(e) => CoordinatorEvent::AuthError { error: e.error },
                    other => {
                        debug!(event = other.event_name(), "Unclaimed coordinator message");
                        continue;
                    }
                };
                if let Err(e) = handler.handle_event(event).await {
                    warn!(error = %e, "Error handling coordinator event");
                }
            }

            // Only tear down if this is still the current connection.
            let mut current = slot.write().await;
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &connection)) {
                *current = None;
                held.clear();
                *state.write().await = ClientState::Disconnected;
            }
            drop(current);

            if let Err(e) = handler.handle_event(CoordinatorEvent::Disconnected).await {
                warn!(error = %e, "Error handling disconnect");
            }
        });
    }
}

fn send_release(
    connection: &CoordinatorConnection,
    worker_id: &banklock_common::WorkerId,
    request_id: RequestId,
    resources: Vec<ResourceKey>,
) {
    info!(request_id = %request_id, "Releasing grant nobody is waiting for");
    let release = ClientMessage::LockRelease(LockReleaseMessage {
        request_id,
        worker_id: worker_id.clone(),
        resources,
    });
    if let Err(e) = connection.send(&release) {
        warn!(error = %e, "Failed to release unclaimed grant");
    }
}

/// Sort and deduplicate keys. Every worker requests keys in this order.
pub fn canonical_order<I>(resources: I) -> Vec<ResourceKey>
where
    I: IntoIterator<Item = ResourceKey>,
{
    let mut keys: Vec<ResourceKey> = resources.into_iter().collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Builder for WorkerClient.
pub struct WorkerClientBuilder {
    config: WorkerConfig,
    handler: Option<Arc<dyn CoordinatorEventHandler>>,
}

impl WorkerClientBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: WorkerConfig::default(),
            handler: None,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set worker ID.
    pub fn worker_id(mut self, id: impl Into<String>) -> Self {
        self.config.worker_id = banklock_common::WorkerId::new(id);
        self
    }

    /// Set coordinator URL.
    pub fn coordinator_url(mut self, url: impl Into<String>) -> Self {
        self.config.coordinator_url = url.into();
        self
    }

    /// Set the registration token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// Set event handler.
    pub fn handler(mut self, handler: Arc<dyn CoordinatorEventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<WorkerClient> {
        self.config
            .validate()
            .map_err(BankLockError::ConfigurationError)?;

        let handler = self.handler.unwrap_or_else(|| Arc::new(LoggingHandler));
        Ok(WorkerClient::new(self.config, handler))
    }
}

impl Default for WorkerClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_sorts_and_dedups() {
        let keys = canonical_order(vec![
            ResourceKey::account("acc-2"),
            ResourceKey::card("card-1"),
            ResourceKey::account("acc-1"),
            ResourceKey::account("acc-2"),
        ]);
        assert_eq!(
            keys,
            vec![
                ResourceKey::account("acc-1"),
                ResourceKey::account("acc-2"),
                ResourceKey::card("card-1"),
            ]
        );
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = WorkerClientBuilder::new().worker_id("teller-1").build().unwrap();

        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(client.active_lock_count(), 0);
    }

    #[tokio::test]
    async fn test_acquire_requires_connection() {
        let client = WorkerClientBuilder::new().build().unwrap();

        let err = client
            .acquire([ResourceKey::account("acc-1")], Priority::Normal, "transfer")
            .await
            .unwrap_err();
        assert!(matches!(err, BankLockError::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_acquire_rejects_empty_resource_list() {
        let client = WorkerClientBuilder::new().build().unwrap();

        let err = client
            .acquire(Vec::new(), Priority::Normal, "transfer")
            .await
            .unwrap_err();
        assert!(matches!(err, BankLockError::InvalidMessage { .. }));
    }

    #[test]
    fn test_builder_validates_config() {
        assert!(matches!(
            WorkerClientBuilder::new().capacity(0).build(),
            Err(BankLockError::ConfigurationError(_))
        ));
    }
}
