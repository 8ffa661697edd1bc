//! BankLock Coordinator
//!
//! Central authority granting exclusive access to bank resources across
//! worker processes. Holds the lock table, wait queue, worker registry and
//! deadlock detector, and serves the worker WebSocket protocol and the HTTP
//! admin surface.

pub mod coordinator;
pub mod config;
pub mod connection;
pub mod deadlock_detector;
pub mod lock_table;
pub mod metrics;
pub mod server;
pub mod state;
pub mod wait_queue;
pub mod worker_registry;

pub use coordinator::{Coordinator, Evaluation, Maintenance};
pub use config::CoordinatorConfig;
pub use connection::ConnectionId;
pub use state::CoordinatorState;
