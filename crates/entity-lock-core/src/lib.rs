//! entity-lock Core Library
//!
//! This crate coordinates shared and exclusive access to entities identified
//! by UUIDs, across tasks and processes, on top of a broker that offers
//! session-scoped advisory locks keyed by integers. It provides:
//! - Lock id resolution (UUID -> stable `i64` key, persisted + cached)
//! - Mapping stores (PostgreSQL, SQLite) with schema migrations
//! - Broker backends (PostgreSQL advisory locks, in-process broker)
//! - Lock sessions pinned to exactly one broker connection
//! - The lock service and its scoped units of work
//! - Lock lifecycle events

pub mod broker;
pub mod config;
pub mod error;
pub mod event;
pub mod resolver;
pub mod service;
pub mod session;
pub mod store;
pub mod types;

pub use error::{LockError, LockResult};
pub use service::{DistributedLockService, LockHandle, LockScope};
pub use types::{EntityId, LockId, LockMode, LockState};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{LockError, LockResult};
    pub use crate::service::{DistributedLockService, LockHandle, LockScope};
    pub use crate::types::{EntityId, LockId, LockMode, LockState};
}
