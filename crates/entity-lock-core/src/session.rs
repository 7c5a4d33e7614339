//! Lock sessions
//!
//! A `LockSession` owns exactly one broker connection and issues every
//! acquire and release of a unit of work on it. Advisory locks are scoped to
//! the connection, so a lock taken through one session can only be released
//! through that same session. The session keeps its own hold counts and
//! refuses releases it cannot match instead of forwarding them to the broker.
//!
//! Methods take `&mut self`, so a session cannot be driven by two callers at
//! once.

use crate::broker::{BrokerConnection, LockBroker};
use crate::error::{LockError, LockResult};
use crate::types::{LockId, LockMode};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// One broker connection plus the locks currently held through it
pub struct LockSession {
    id: Uuid,
    connection: Option<Box<dyn BrokerConnection>>,
    /// (lock id, mode) -> number of holds
    held: HashMap<(LockId, LockMode), u32>,
    opened_at: Instant,
}

impl LockSession {
    /// Open a session on a fresh broker connection
    ///
    /// Nothing stays open if the connection cannot be established.
    pub async fn open(broker: &dyn LockBroker) -> LockResult<Self> {
        let connection = broker.connect().await?;
        let session = Self {
            id: Uuid::new_v4(),
            connection: Some(connection),
            held: HashMap::new(),
            opened_at: Instant::now(),
        };
        debug!(session_id = %session.id, "Lock session opened");
        Ok(session)
    }

    /// Session identifier, for logs and events
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the connection is still open
    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    /// Whether this session holds `lock_id` in `mode`
    pub fn holds(&self, lock_id: LockId, mode: LockMode) -> bool {
        self.held.contains_key(&(lock_id, mode))
    }

    /// Number of holds this session has on `lock_id` in `mode`
    pub fn hold_count(&self, lock_id: LockId, mode: LockMode) -> u32 {
        self.held.get(&(lock_id, mode)).copied().unwrap_or(0)
    }

    /// Every (lock id, mode) pair currently held
    pub fn held_locks(&self) -> Vec<(LockId, LockMode)> {
        let mut locks: Vec<_> = self.held.keys().copied().collect();
        locks.sort_by_key(|(lock_id, mode)| (*lock_id, *mode == LockMode::Exclusive));
        locks
    }

    /// Take a shared lock, suspending until the broker grants it
    ///
    /// There is no timeout at this level; the wait is unbounded while another
    /// session holds the lock exclusively.
    pub async fn acquire_shared(&mut self, lock_id: LockId) -> LockResult<()> {
        self.acquire(lock_id, LockMode::Shared).await
    }

    /// Take an exclusive lock, suspending until no other session holds it
    pub async fn acquire_exclusive(&mut self, lock_id: LockId) -> LockResult<()> {
        self.acquire(lock_id, LockMode::Exclusive).await
    }

    /// Release one shared hold
    ///
    /// Returns `true` when this was the session's last shared hold on the lock.
    pub async fn release_shared(&mut self, lock_id: LockId) -> LockResult<bool> {
        self.release(lock_id, LockMode::Shared).await
    }

    /// Release one exclusive hold
    ///
    /// Returns `true` when this was the session's last exclusive hold on the lock.
    pub async fn release_exclusive(&mut self, lock_id: LockId) -> LockResult<bool> {
        self.release(lock_id, LockMode::Exclusive).await
    }

    async fn acquire(&mut self, lock_id: LockId, mode: LockMode) -> LockResult<()> {
        let session_id = self.id;
        let connection = self.connection_mut("acquire")?;

        match mode {
            LockMode::Shared => connection.lock_shared(lock_id).await?,
            LockMode::Exclusive => connection.lock_exclusive(lock_id).await?,
        }

        // Recorded only once granted; a failed or cancelled acquire leaves no hold
        *self.held.entry((lock_id, mode)).or_insert(0) += 1;
        debug!(session_id = %session_id, lock_id = %lock_id, mode = %mode, "Broker granted lock");
        Ok(())
    }

    async fn release(&mut self, lock_id: LockId, mode: LockMode) -> LockResult<bool> {
        let session_id = self.id;
        let count = self.hold_count(lock_id, mode);
        let connection = self.connection_mut("release")?;

        if count == 0 {
            return Err(LockError::SessionMismatch(format!(
                "session {} does not hold a {} lock on {}",
                session_id, mode, lock_id
            )));
        }

        let released = match mode {
            LockMode::Shared => connection.unlock_shared(lock_id).await?,
            LockMode::Exclusive => connection.unlock_exclusive(lock_id).await?,
        };

        if !released {
            // The broker disagrees with our accounting; forget the hold so it is
            // not released twice
            self.held.remove(&(lock_id, mode));
            return Err(LockError::SessionMismatch(format!(
                "broker reports {} lock {} not held by session {}",
                mode, lock_id, session_id
            )));
        }

        let last = count == 1;
        if last {
            self.held.remove(&(lock_id, mode));
        } else {
            self.held.insert((lock_id, mode), count - 1);
        }
        debug!(session_id = %session_id, lock_id = %lock_id, mode = %mode, last, "Broker released lock");
        Ok(last)
    }

    /// Close the connection
    ///
    /// Any lock still held is released by the broker when the connection ends.
    pub async fn close(mut self) -> LockResult<()> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        if !self.held.is_empty() {
            warn!(
                session_id = %self.id,
                held = self.held.len(),
                "Closing lock session with held locks; the broker releases them"
            );
        }
        self.held.clear();
        let result = connection.close().await;
        debug!(
            session_id = %self.id,
            lifetime_ms = self.opened_at.elapsed().as_millis() as u64,
            "Lock session closed"
        );
        result
    }

    /// Drop the connection without a graceful close
    ///
    /// Used after a cancelled or failed broker call, when the connection may
    /// be mid-command and must not be reused. Locks already granted go away
    /// once the broker notices the disconnect. On PostgreSQL a backend still
    /// queued in `pg_advisory_lock` does not notice on its own; the broker
    /// cancels it from a side connection, so the wait ends shortly after
    /// rather than immediately.
    pub fn discard(mut self) {
        if let Some(connection) = self.connection.take() {
            warn!(session_id = %self.id, held = self.held.len(), "Discarding lock session");
            self.held.clear();
            drop(connection);
        }
    }

    fn connection_mut(&mut self, operation: &str) -> LockResult<&mut Box<dyn BrokerConnection>> {
        let id = self.id;
        self.connection.as_mut().ok_or_else(|| {
            LockError::SessionMismatch(format!("cannot {} on closed session {}", operation, id))
        })
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        if self.connection.is_some() && !self.held.is_empty() {
            warn!(
                session_id = %self.id,
                held = self.held.len(),
                "Lock session dropped with held locks; the broker releases them"
            );
        }
    }
}

impl fmt::Debug for LockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockSession")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .field("held", &self.held)
            .finish()
    }
}

impl fmt::Display for LockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LockSession[{}]", self.id)
    }
}
