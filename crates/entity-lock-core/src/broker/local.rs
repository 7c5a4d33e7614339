//! In-process lock broker
//!
//! Mirrors PostgreSQL advisory-lock semantics inside one process:
//! - holds are counted per connection, so a connection may re-take a lock it holds
//! - a connection never conflicts with its own holds
//! - shared holds from different connections coexist; an exclusive hold
//!   excludes every other connection
//! - closing or dropping a connection releases all of its holds
//!
//! Waiters suspend on a `Notify` and re-check the table after every release,
//! so dropping a pending acquire never leaves a hold behind.

use super::{BrokerConnection, LockBroker};
use crate::error::LockResult;
use crate::types::{LockId, LockMode};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::trace;

/// Holds on one key
#[derive(Debug, Default)]
struct KeyHolds {
    /// connection id -> shared hold count
    shared: HashMap<u64, u32>,
    /// (connection id, exclusive hold count)
    exclusive: Option<(u64, u32)>,
}

impl KeyHolds {
    fn is_empty(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }

    fn grantable(&self, conn: u64, mode: LockMode) -> bool {
        let exclusive_by_other = matches!(self.exclusive, Some((holder, _)) if holder != conn);
        match mode {
            LockMode::Shared => !exclusive_by_other,
            LockMode::Exclusive => {
                !exclusive_by_other && self.shared.keys().all(|holder| *holder == conn)
            }
        }
    }

    fn holder_count(&self) -> usize {
        let exclusive_only = match self.exclusive {
            Some((holder, _)) if !self.shared.contains_key(&holder) => 1,
            _ => 0,
        };
        self.shared.len() + exclusive_only
    }
}

#[derive(Debug, Default)]
struct Inner {
    table: Mutex<HashMap<i64, KeyHolds>>,
    released: Notify,
    next_connection: AtomicU64,
}

impl Inner {
    fn table(&self) -> MutexGuard<'_, HashMap<i64, KeyHolds>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_grant(&self, conn: u64, key: i64, mode: LockMode) -> bool {
        let mut table = self.table();
        if let Some(holds) = table.get(&key) {
            if !holds.grantable(conn, mode) {
                return false;
            }
        }

        let holds = table.entry(key).or_default();
        match mode {
            LockMode::Shared => *holds.shared.entry(conn).or_insert(0) += 1,
            LockMode::Exclusive => match holds.exclusive.as_mut() {
                Some((_, count)) => *count += 1,
                None => holds.exclusive = Some((conn, 1)),
            },
        }
        true
    }

    fn release(&self, conn: u64, key: i64, mode: LockMode) -> bool {
        let mut table = self.table();
        let Some(holds) = table.get_mut(&key) else {
            return false;
        };

        let released = match mode {
            LockMode::Shared => match holds.shared.get_mut(&conn) {
                Some(count) => {
                    *count -= 1;
                    if *count == 0 {
                        holds.shared.remove(&conn);
                    }
                    true
                }
                None => false,
            },
            LockMode::Exclusive => match holds.exclusive.as_mut() {
                Some((holder, count)) if *holder == conn => {
                    *count -= 1;
                    if *count == 0 {
                        holds.exclusive = None;
                    }
                    true
                }
                _ => false,
            },
        };

        if holds.is_empty() {
            table.remove(&key);
        }
        drop(table);

        if released {
            self.released.notify_waiters();
        }
        released
    }

    fn release_all(&self, conn: u64) {
        let mut table = self.table();
        let mut touched = false;
        table.retain(|_, holds| {
            touched |= holds.shared.remove(&conn).is_some();
            if matches!(holds.exclusive, Some((holder, _)) if holder == conn) {
                holds.exclusive = None;
                touched = true;
            }
            !holds.is_empty()
        });
        drop(table);

        if touched {
            self.released.notify_waiters();
        }
    }
}

/// In-process broker with advisory-lock semantics
///
/// Clones share the same lock table.
#[derive(Debug, Clone, Default)]
pub struct LocalLockBroker {
    inner: Arc<Inner>,
}

impl LocalLockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections holding `key` in any mode
    pub fn holder_count(&self, key: LockId) -> usize {
        self.inner
            .table()
            .get(&key.get())
            .map(KeyHolds::holder_count)
            .unwrap_or(0)
    }

    /// Number of keys with at least one holder
    pub fn locked_keys(&self) -> usize {
        self.inner.table().len()
    }
}

#[async_trait]
impl LockBroker for LocalLockBroker {
    async fn connect(&self) -> LockResult<Box<dyn BrokerConnection>> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(connection = id, "Opened local broker connection");
        Ok(Box::new(LocalConnection {
            id,
            inner: Arc::clone(&self.inner),
        }))
    }
}

#[derive(Debug)]
struct LocalConnection {
    id: u64,
    inner: Arc<Inner>,
}

impl LocalConnection {
    async fn wait_for(&self, key: LockId, mode: LockMode) {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await still wakes us
            notified.as_mut().enable();

            if self.inner.try_grant(self.id, key.get(), mode) {
                trace!(connection = self.id, key = %key, mode = %mode, "Granted");
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl BrokerConnection for LocalConnection {
    async fn lock_shared(&mut self, key: LockId) -> LockResult<()> {
        self.wait_for(key, LockMode::Shared).await;
        Ok(())
    }

    async fn lock_exclusive(&mut self, key: LockId) -> LockResult<()> {
        self.wait_for(key, LockMode::Exclusive).await;
        Ok(())
    }

    async fn unlock_shared(&mut self, key: LockId) -> LockResult<bool> {
        Ok(self.inner.release(self.id, key.get(), LockMode::Shared))
    }

    async fn unlock_exclusive(&mut self, key: LockId) -> LockResult<bool> {
        Ok(self.inner.release(self.id, key.get(), LockMode::Exclusive))
    }

    async fn close(self: Box<Self>) -> LockResult<()> {
        // Drop releases the holds
        Ok(())
    }
}

impl Drop for LocalConnection {
    fn drop(&mut self) {
        self.inner.release_all(self.id);
        trace!(connection = self.id, "Closed local broker connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const KEY: LockId = LockId::new(7);

    async fn blocked<F: std::future::Future>(fut: F) -> bool {
        timeout(Duration::from_millis(50), fut).await.is_err()
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_shared(KEY).await.unwrap();
        assert!(!blocked(b.lock_shared(KEY)).await);
        assert_eq!(broker.holder_count(KEY), 2);
    }

    #[tokio::test]
    async fn test_exclusive_blocks_other_connections() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_exclusive(KEY).await.unwrap();
        assert!(blocked(b.lock_shared(KEY)).await);
        assert!(blocked(b.lock_exclusive(KEY)).await);

        assert!(a.unlock_exclusive(KEY).await.unwrap());
        assert!(!blocked(b.lock_exclusive(KEY)).await);
    }

    #[tokio::test]
    async fn test_shared_blocks_exclusive_from_other_connection() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_shared(KEY).await.unwrap();
        assert!(blocked(b.lock_exclusive(KEY)).await);
        // Own shared hold never blocks own exclusive request
        assert!(!blocked(a.lock_exclusive(KEY)).await);
    }

    #[tokio::test]
    async fn test_reentrant_holds_are_counted() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_exclusive(KEY).await.unwrap();
        a.lock_exclusive(KEY).await.unwrap();

        assert!(a.unlock_exclusive(KEY).await.unwrap());
        assert!(blocked(b.lock_shared(KEY)).await);

        assert!(a.unlock_exclusive(KEY).await.unwrap());
        assert!(!a.unlock_exclusive(KEY).await.unwrap());
        assert!(!blocked(b.lock_shared(KEY)).await);
    }

    #[tokio::test]
    async fn test_unlock_from_other_connection_is_refused() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_exclusive(KEY).await.unwrap();
        assert!(!b.unlock_exclusive(KEY).await.unwrap());
        assert!(!b.unlock_shared(KEY).await.unwrap());
        assert_eq!(broker.holder_count(KEY), 1);
    }

    #[tokio::test]
    async fn test_dropping_connection_releases_holds() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_exclusive(KEY).await.unwrap();
        a.lock_shared(LockId::new(8)).await.unwrap();
        assert_eq!(broker.locked_keys(), 2);

        drop(a);
        assert_eq!(broker.locked_keys(), 0);
        assert!(!blocked(b.lock_exclusive(KEY)).await);
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_no_hold() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_exclusive(KEY).await.unwrap();
        assert!(blocked(b.lock_exclusive(KEY)).await);
        assert_eq!(broker.holder_count(KEY), 1);

        a.close().await.unwrap();
        assert_eq!(broker.holder_count(KEY), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiter_wakes_on_release() {
        let broker = LocalLockBroker::new();
        let mut a = broker.connect().await.unwrap();
        let mut b = broker.connect().await.unwrap();

        a.lock_exclusive(KEY).await.unwrap();
        let waiter = tokio::spawn(async move {
            b.lock_shared(KEY).await.unwrap();
            b
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        a.unlock_exclusive(KEY).await.unwrap();
        let _b = timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be granted after release")
            .unwrap();
        assert_eq!(broker.holder_count(KEY), 1);
    }
}
