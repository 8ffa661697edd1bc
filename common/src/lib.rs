//! BankLock Common Types
//!
//! Shared types used by the lock coordinator, the worker client and the wire
//! protocol: worker and request identifiers, lockable resource keys,
//! priorities and the common error type.

pub mod identifiers;
pub mod resource;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use resource::*;
pub use error::*;
pub use time::*;
