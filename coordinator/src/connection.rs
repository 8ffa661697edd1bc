//! Live worker connections.
//!
//! Each socket gets an id and an unbounded outbound channel. The socket's
//! writer task drains the channel; dropping the sender (via
//! [`ConnectionHub::close`]) ends the writer, which closes the socket.

use std::fmt;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use banklock_protocol::ServerMessage;

/// Identity of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new random connection id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound channel of one connection.
pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;
/// Receiving half drained by the socket writer.
pub type OutboundReceiver = mpsc::UnboundedReceiver<ServerMessage>;

/// Registry of open connections.
#[derive(Debug, Default)]
pub struct ConnectionHub {
    senders: DashMap<ConnectionId, OutboundSender>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection and return its outbound receiver.
    pub fn open(&self) -> (ConnectionId, OutboundReceiver) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.insert(id, tx);
        debug!(connection_id = %id, "Connection opened");
        (id, rx)
    }

    /// Queue `message` for delivery. Returns false if the connection is gone.
    pub fn send(&self, id: ConnectionId, message: ServerMessage) -> bool {
        let Some(sender) = self.senders.get(&id) else {
            debug!(connection_id = %id, event = message.event_name(), "Dropping message for closed connection");
            return false;
        };

        if sender.send(message).is_err() {
            drop(sender);
            warn!(connection_id = %id, "Outbound channel closed, removing connection");
            self.senders.remove(&id);
            return false;
        }
        true
    }

    /// Close a connection. Returns false if it was already closed.
    pub fn close(&self, id: ConnectionId) -> bool {
        let removed = self.senders.remove(&id).is_some();
        if removed {
            debug!(connection_id = %id, "Connection closed");
        }
        removed
    }

    /// Whether the connection is still open.
    pub fn is_live(&self, id: ConnectionId) -> bool {
        self.senders
            .get(&id)
            .map(|sender| !sender.is_closed())
            .unwrap_or(false)
    }

    /// Close every connection, returning how many were open.
    pub fn close_all(&self) -> usize {
        let count = self.senders.len();
        self.senders.clear();
        count
    }

    /// Number of open connections.
    pub fn count(&self) -> usize {
        self.senders.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use banklock_protocol::ForceRelease;
    use banklock_common::RequestId;

    fn force_release() -> ServerMessage {
        ServerMessage::ForceRelease(ForceRelease {
            request_id: RequestId::new("r-1"),
        })
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let hub = ConnectionHub::new();
        let (id, mut rx) = hub.open();

        assert!(hub.is_live(id));
        assert!(hub.send(id, force_release()));
        assert_eq!(rx.recv().await, Some(force_release()));

        assert!(hub.close(id));
        assert!(!hub.is_live(id));
        assert!(!hub.send(id, force_release()));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_not_live() {
        let hub = ConnectionHub::new();
        let (id, rx) = hub.open();
        drop(rx);

        assert!(!hub.is_live(id));
        assert!(!hub.send(id, force_release()));
        assert_eq!(hub.count(), 0);
    }

    #[test]
    fn test_close_all() {
        let hub = ConnectionHub::new();
        let _a = hub.open();
        let _b = hub.open();
        assert_eq!(hub.close_all(), 2);
        assert_eq!(hub.count(), 0);
    }
}
