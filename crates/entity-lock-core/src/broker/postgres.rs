//! PostgreSQL advisory-lock broker
//!
//! A backend blocked in `pg_advisory_lock` does not read its socket, so
//! dropping the client side alone leaves it queued on the lock until the
//! lock is granted, and only then does it notice the disconnect and exit.
//! Connections dropped mid-wait therefore ask the server to cancel their
//! backend from a short-lived side connection.

use super::{BrokerConnection, LockBroker};
use crate::error::{LockError, LockResult};
use crate::types::LockId;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Broker backed by PostgreSQL session-level advisory locks
///
/// Every `connect` opens a dedicated connection outside any pool. A pooled
/// connection would go back to the pool still holding its advisory locks and
/// be handed to an unrelated caller.
#[derive(Debug, Clone)]
pub struct PgLockBroker {
    options: PgConnectOptions,
}

impl PgLockBroker {
    /// Create a broker for the given connection URL
    pub fn new(url: &str) -> LockResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|e| LockError::Config(format!("Invalid PostgreSQL URL: {}", e)))?;
        Ok(Self { options })
    }

    /// Create a broker from prepared connect options
    pub fn with_options(options: PgConnectOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl LockBroker for PgLockBroker {
    async fn connect(&self) -> LockResult<Box<dyn BrokerConnection>> {
        let mut conn = self.options.connect().await?;
        let backend_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await?;
        debug!(backend_pid, "Opened broker connection");
        Ok(Box::new(PgBrokerConnection {
            conn,
            waiter: PendingWait {
                options: self.options.clone(),
                backend_pid,
                waiting: false,
            },
        }))
    }
}

struct PgBrokerConnection {
    conn: PgConnection,
    waiter: PendingWait,
}

impl PgBrokerConnection {
    async fn wait_for(&mut self, sql: &'static str, key: LockId) -> LockResult<()> {
        self.waiter.waiting = true;
        let result = sqlx::query(sql).bind(key.get()).execute(&mut self.conn).await;
        self.waiter.waiting = false;
        result?;
        Ok(())
    }
}

/// Cancels the backend on drop if a lock wait was still in flight
struct PendingWait {
    options: PgConnectOptions,
    backend_pid: i32,
    waiting: bool,
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if !self.waiting {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                backend_pid = self.backend_pid,
                "No runtime to cancel an abandoned lock wait; backend stays queued until granted"
            );
            return;
        };
        let options = self.options.clone();
        let backend_pid = self.backend_pid;
        runtime.spawn(async move {
            match options.connect().await {
                Ok(mut conn) => {
                    let cancelled = sqlx::query_scalar::<_, bool>("SELECT pg_cancel_backend($1)")
                        .bind(backend_pid)
                        .fetch_one(&mut conn)
                        .await;
                    debug!(backend_pid, ?cancelled, "Cancelled abandoned lock wait");
                    let _ = conn.close().await;
                }
                Err(e) => {
                    warn!(backend_pid, error = %e, "Failed to cancel abandoned lock wait");
                }
            }
        });
    }
}

impl fmt::Debug for PgBrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgBrokerConnection").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerConnection for PgBrokerConnection {
    async fn lock_shared(&mut self, key: LockId) -> LockResult<()> {
        self.wait_for("SELECT pg_advisory_lock_shared($1)", key).await
    }

    async fn lock_exclusive(&mut self, key: LockId) -> LockResult<()> {
        self.wait_for("SELECT pg_advisory_lock($1)", key).await
    }

    async fn unlock_shared(&mut self, key: LockId) -> LockResult<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock_shared($1)")
            .bind(key.get())
            .fetch_one(&mut self.conn)
            .await?;
        Ok(released)
    }

    async fn unlock_exclusive(&mut self, key: LockId) -> LockResult<bool> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key.get())
            .fetch_one(&mut self.conn)
            .await?;
        Ok(released)
    }

    async fn close(self: Box<Self>) -> LockResult<()> {
        // The server drops all session-level advisory locks when the backend exits
        let PgBrokerConnection { conn, .. } = *self;
        conn.close().await?;
        debug!("Closed broker connection");
        Ok(())
    }
}
