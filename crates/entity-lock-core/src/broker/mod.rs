//! Lock broker adapters
//!
//! A broker hands out connections, and each connection can take
//! session-scoped advisory locks keyed by `i64`. Locks belong to the
//! connection that took them: releasing through another connection does not
//! release them, and closing a connection releases everything it holds.
//!
//! - `postgres`: `pg_advisory_lock` family on a dedicated `PgConnection`
//! - `local`: in-process broker with the same semantics

pub mod local;
pub mod postgres;

use crate::error::LockResult;
use crate::types::LockId;
use async_trait::async_trait;
use std::fmt;

pub use local::LocalLockBroker;
pub use postgres::PgLockBroker;

/// Source of broker connections
#[async_trait]
pub trait LockBroker: Send + Sync + fmt::Debug {
    /// Open a new connection owned exclusively by the caller
    async fn connect(&self) -> LockResult<Box<dyn BrokerConnection>>;
}

/// One live broker connection; advisory locks are scoped to it
///
/// Acquire calls wait until the lock is granted and take no timeout. Dropping
/// an in-flight acquire leaves the connection in an undefined state, so
/// callers that cancel must discard the connection.
#[async_trait]
pub trait BrokerConnection: Send + fmt::Debug {
    /// Take a shared lock, waiting while another connection holds it exclusively
    async fn lock_shared(&mut self, key: LockId) -> LockResult<()>;

    /// Take an exclusive lock, waiting while any other connection holds it
    async fn lock_exclusive(&mut self, key: LockId) -> LockResult<()>;

    /// Release one shared hold; `false` if this connection held none
    async fn unlock_shared(&mut self, key: LockId) -> LockResult<bool>;

    /// Release one exclusive hold; `false` if this connection held none
    async fn unlock_exclusive(&mut self, key: LockId) -> LockResult<bool>;

    /// Close the connection, releasing every lock still held through it
    async fn close(self: Box<Self>) -> LockResult<()>;
}
