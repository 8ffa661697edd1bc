//! Handling of unsolicited coordinator events.

use banklock_common::{RequestId, Result};

/// Coordinator events not tied to an in-flight `acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A grant outlived its hold time and was revoked.
    ForceRelease { request_id: RequestId },
    /// A grant arrived after `acquire` gave up on it; it has been released.
    LateGrant { request_id: RequestId },
    /// The coordinator rejected a frame.
    ValidationError { tipo: String, error: String },
    /// The coordinator rejected this worker's credentials.
    AuthError { error: String },
    /// The connection closed.
    Disconnected,
}

/// Trait for reacting to coordinator events.
#[async_trait::async_trait]
pub trait CoordinatorEventHandler: Send + Sync {
    /// Handle an event.
    async fn handle_event(&self, event: CoordinatorEvent) -> Result<()>;
}

/// Default handler that logs events.
pub struct LoggingHandler;

#[async_trait::async_trait]
impl CoordinatorEventHandler for LoggingHandler {
    async fn handle_event(&self, event: CoordinatorEvent) -> Result<()> {
        match event {
            CoordinatorEvent::ForceRelease { request_id } => {
                tracing::warn!(request_id = %request_id, "Lock revoked by coordinator");
            }
            CoordinatorEvent::LateGrant { request_id } => {
                tracing::info!(request_id = %request_id, "Late grant released");
            }
            CoordinatorEvent::ValidationError { tipo, error } => {
                tracing::warn!(tipo = %tipo, error = %error, "Coordinator rejected message");
            }
            CoordinatorEvent::AuthError { error } => {
                tracing::error!(error = %error, "Coordinator authentication error");
            }
            CoordinatorEvent::Disconnected => {
                tracing::info!("Disconnected from coordinator");
            }
        }
        Ok(())
    }
}

/// Handler that forwards events to callback functions.
pub struct CallbackHandler {
    on_force_release: Option<Box<dyn Fn(RequestId) + Send + Sync>>,
    on_disconnect: Option<Box<dyn Fn() + Send + Sync>>,
}

impl CallbackHandler {
    /// Create a new callback handler.
    pub fn new() -> Self {
        Self {
            on_force_release: None,
            on_disconnect: None,
        }
    }

    /// Set the revoked-grant callback.
    pub fn on_force_release<F>(mut self, callback: F) -> Self
    where
        F: Fn(RequestId) + Send + Sync + 'static,
    {
        self.on_force_release = Some(Box::new(callback));
        self
    }

    /// Set the disconnect callback.
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self
    }
}

impl Default for CallbackHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CoordinatorEventHandler for CallbackHandler {
    async fn handle_event(&self, event: CoordinatorEvent) -> Result<()> {
        match event {
            CoordinatorEvent::ForceRelease { request_id } => {
                if let Some(callback) = &self.on_force_release {
                    callback(request_id);
                }
            }
            CoordinatorEvent::Disconnected => {
                if let Some(callback) = &self.on_disconnect {
                    callback();
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_callback_handler_forwards_force_release() {
        let revoked = Arc::new(AtomicUsize::new(0));
        let counter = revoked.clone();
        let handler = CallbackHandler::new().on_force_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handler
            .handle_event(CoordinatorEvent::ForceRelease {
                request_id: RequestId::new("r-1"),
            })
            .await
            .unwrap();
        handler.handle_event(CoordinatorEvent::Disconnected).await.unwrap();

        assert_eq!(revoked.load(Ordering::SeqCst), 1);
    }
}
