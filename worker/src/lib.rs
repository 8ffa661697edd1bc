//! BankLock Worker Library
//!
//! Client used by teller processes to register with the lock coordinator,
//! keep their registration alive and lock accounts and cards around a
//! critical section.

pub mod client;
pub mod config;
pub mod connection;
pub mod handler;

pub use client::{canonical_order, ClientState, LockHandle, WorkerClient, WorkerClientBuilder};
pub use config::WorkerConfig;
pub use handler::{CallbackHandler, CoordinatorEvent, CoordinatorEventHandler, LoggingHandler};
