//! WebSocket connection to the coordinator.
//!
//! A reader task decodes coordinator frames and routes them: replies to an
//! in-flight `LOCK_REQUEST` go to that request's waiter, `status-response`
//! frames go to the oldest status waiter, everything else goes to the event
//! stream returned by [`CoordinatorConnection::open`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

use banklock_common::{BankLockError, RequestId, Result};
use banklock_protocol::{decode_server_message, encode, ClientMessage, ServerMessage, StatusSnapshot};

/// Coordinator messages not claimed by a pending request.
pub type EventReceiver = mpsc::UnboundedReceiver<ServerMessage>;

/// Replies for one in-flight request.
pub type ReplyReceiver = mpsc::UnboundedReceiver<ServerMessage>;

type Waiters = Arc<DashMap<RequestId, mpsc::UnboundedSender<ServerMessage>>>;
type StatusWaiters = Arc<Mutex<VecDeque<oneshot::Sender<StatusSnapshot>>>>;

/// Connection to the coordinator.
pub struct CoordinatorConnection {
    /// Coordinator URL.
    url: String,
    /// Frames for the writer task.
    outbound: mpsc::UnboundedSender<Message>,
    /// Per-request reply channels.
    waiters: Waiters,
    status_waiters: StatusWaiters,
    /// Cleared when the socket closes.
    connected: Arc<AtomicBool>,
}

impl CoordinatorConnection {
    /// Connect to `url` and start the reader and writer tasks.
    pub async fn open(url: &str, timeout: Duration) -> Result<(Self, EventReceiver)> {
        let (stream, _) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| BankLockError::NetworkError(format!("connecting to {} timed out", url)))?
            .map_err(|e| BankLockError::NetworkError(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let waiters: Waiters = Arc::new(DashMap::new());
        let status_waiters: StatusWaiters = Arc::new(Mutex::new(VecDeque::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "Send to coordinator failed");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        {
            let waiters = waiters.clone();
            let status_waiters = status_waiters.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!(error = %e, "Coordinator socket error");
                            break;
                        }
                    };
                    match decode_server_message(&text) {
                        Ok(message) => route(message, &waiters, &status_waiters, &events_tx),
                        Err(e) => warn!(error = %e.error, "Undecodable frame from coordinator"),
                    }
                }

                connected.store(false, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with a closed channel.
                waiters.clear();
                status_waiters.lock().clear();
                debug!("Coordinator connection closed");
            });
        }

        let connection = Self {
            url: url.to_string(),
            outbound,
            waiters,
            status_waiters,
            connected,
        };
        Ok((connection, events_rx))
    }

    /// Send one message.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(BankLockError::NetworkError("Not connected".to_string()));
        }
        let text = encode(message)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| BankLockError::NetworkError("Connection writer stopped".to_string()))
    }

    /// Route replies for `request_id` to the returned receiver until
    /// [`unsubscribe`](Self::unsubscribe) is called.
    pub fn subscribe(&self, request_id: &RequestId) -> ReplyReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.insert(request_id.clone(), tx);
        rx
    }

    pub fn unsubscribe(&self, request_id: &RequestId) {
        self.waiters.remove(request_id);
    }

    /// Send `status-request` and return a receiver for the answer.
    pub fn request_status(&self) -> Result<oneshot::Receiver<StatusSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.status_waiters.lock().push_back(tx);
        if let Err(e) = self.send(&ClientMessage::StatusRequest) {
            self.status_waiters.lock().pop_back();
            return Err(e);
        }
        Ok(rx)
    }

    /// Send a Close frame.
    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn route(
    mut message: ServerMessage,
    waiters: &Waiters,
    status_waiters: &StatusWaiters,
    events: &mpsc::UnboundedSender<ServerMessage>,
) {
    if let ServerMessage::StatusResponse(snapshot) = message {
        if let Some(waiter) = status_waiters.lock().pop_front() {
            let _ = waiter.send(*snapshot);
        }
        return;
    }

    if !matches!(message, ServerMessage::ForceRelease(_)) {
        let waiter = message
            .request_id()
            .and_then(|id| waiters.get(id).map(|w| w.value().clone()));
        if let Some(waiter) = waiter {
            match waiter.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(unclaimed)) => message = unclaimed,
            }
        }
    }

    let _ = events.send(message);
}
