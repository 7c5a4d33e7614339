//! Distributed lock service
//!
//! The service resolves entity ids to lock ids and takes broker locks through
//! a `LockScope`. A scope is one unit of work: it owns a single lock session,
//! so every acquire and release made through it runs on the same broker
//! connection. Scopes are owned values taking `&mut self`, which keeps a
//! session from being used by two independent callers at once.
//!
//! The single-lock calls (`acquire_read_lock` and friends) return a
//! `LockHandle`, a scope holding exactly one lock, which must be handed back
//! to the matching release call.
//!
//! Acquires wait as long as the broker makes them wait unless a deadline is
//! given, either per call or through `locking.default_deadline_ms`. The
//! deadline covers the whole call: resolving the lock id, opening the
//! session, and waiting on the broker. When it expires during the broker
//! wait, or the caller drops a pending acquire or release, the scope's
//! session is discarded, the broker drops every lock the scope held, and the
//! scope is marked failed.

use crate::broker::{BrokerConnection, LocalLockBroker, LockBroker, PgLockBroker};
use crate::config::{Backend, Config, LockingConfig};
use crate::error::{LockError, LockResult};
use crate::event::LockEvent;
use crate::resolver::LockIdResolver;
use crate::session::LockSession;
use crate::store::{MappingStore, PgMappingStore, SqliteMappingStore};
use crate::types::{EntityId, LockId, LockMode, LockState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Entry point for entity locks
#[derive(Debug)]
pub struct DistributedLockService {
    resolver: Arc<LockIdResolver>,
    broker: Arc<dyn LockBroker>,
    config: LockingConfig,
    events: broadcast::Sender<LockEvent>,
}

impl DistributedLockService {
    /// Create a service from an existing store and broker
    pub fn new(
        store: Arc<dyn MappingStore>,
        broker: Arc<dyn LockBroker>,
        config: LockingConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            resolver: Arc::new(LockIdResolver::new(store)),
            broker,
            config,
            events,
        }
    }

    /// Build the store and broker selected by the configured URL
    ///
    /// A PostgreSQL URL uses the database for both the mapping and the
    /// advisory locks. A SQLite URL pairs the embedded store with the
    /// in-process broker, so locks only exclude callers in this process.
    pub async fn connect(config: &Config) -> LockResult<Self> {
        config
            .validate()
            .map_err(|e| LockError::Config(e.to_string()))?;
        let backend = config
            .database
            .backend()
            .map_err(|e| LockError::Config(e.to_string()))?;
        let url = config.database.resolved_url();
        let db = &config.database;

        let (store, broker): (Arc<dyn MappingStore>, Arc<dyn LockBroker>) = match backend {
            Backend::Postgres => {
                let broker = PgLockBroker::new(&url)?;
                let store = PgMappingStore::connect(&url, db.max_connections, db.auto_migrate).await?;
                (Arc::new(store), Arc::new(broker))
            }
            Backend::Sqlite => {
                warn!(
                    url = %db.redacted_url(),
                    "SQLite backend selected; locks only exclude callers in this process"
                );
                let store =
                    SqliteMappingStore::connect(&url, db.max_connections, db.auto_migrate).await?;
                (Arc::new(store), Arc::new(LocalLockBroker::new()))
            }
        };

        info!(url = %db.redacted_url(), ?backend, "Lock service connected");
        Ok(Self::new(store, broker, config.locking.clone()))
    }

    /// The lock id resolver
    pub fn resolver(&self) -> &Arc<LockIdResolver> {
        &self.resolver
    }

    /// Locking configuration in effect
    pub fn config(&self) -> &LockingConfig {
        &self.config
    }

    /// Subscribe to lock lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.events.subscribe()
    }

    /// Check that both the mapping store and the broker are reachable
    pub async fn health_check(&self) -> LockResult<()> {
        self.resolver.store().health_check().await?;
        let connection = self.broker.connect().await?;
        connection.close().await
    }

    /// Start a unit of work
    ///
    /// No broker connection is opened until the first acquire.
    pub fn begin(&self) -> LockScope {
        LockScope {
            id: Uuid::new_v4(),
            resolver: Arc::clone(&self.resolver),
            broker: Arc::clone(&self.broker),
            events: self.events.clone(),
            default_deadline: self.config.default_deadline(),
            session: None,
            usages: HashMap::new(),
            failed: false,
        }
    }

    /// Take a read lock on `entity_id` in a fresh scope
    pub async fn acquire_read_lock(&self, entity_id: EntityId) -> LockResult<LockHandle> {
        self.acquire_handle(entity_id, LockMode::Shared, self.config.default_deadline())
            .await
    }

    /// Take a write lock on `entity_id` in a fresh scope
    pub async fn acquire_write_lock(&self, entity_id: EntityId) -> LockResult<LockHandle> {
        self.acquire_handle(entity_id, LockMode::Exclusive, self.config.default_deadline())
            .await
    }

    /// Take a read lock, giving up with `LockError::Timeout` after `deadline`
    pub async fn acquire_read_lock_within(
        &self,
        entity_id: EntityId,
        deadline: Duration,
    ) -> LockResult<LockHandle> {
        self.acquire_handle(entity_id, LockMode::Shared, Some(deadline))
            .await
    }

    /// Take a write lock, giving up with `LockError::Timeout` after `deadline`
    pub async fn acquire_write_lock_within(
        &self,
        entity_id: EntityId,
        deadline: Duration,
    ) -> LockResult<LockHandle> {
        self.acquire_handle(entity_id, LockMode::Exclusive, Some(deadline))
            .await
    }

    /// Release a read lock taken with `acquire_read_lock`
    ///
    /// Passing a write-lock handle is a `SessionMismatch`; the handle is
    /// consumed either way and its session is closed, which frees the lock.
    pub async fn release_read_lock(&self, handle: LockHandle) -> LockResult<bool> {
        self.release_handle(handle, LockMode::Shared).await
    }

    /// Release a write lock taken with `acquire_write_lock`
    ///
    /// Passing a read-lock handle is a `SessionMismatch`; the handle is
    /// consumed either way and its session is closed, which frees the lock.
    pub async fn release_write_lock(&self, handle: LockHandle) -> LockResult<bool> {
        self.release_handle(handle, LockMode::Exclusive).await
    }

    async fn acquire_handle(
        &self,
        entity_id: EntityId,
        mode: LockMode,
        deadline: Option<Duration>,
    ) -> LockResult<LockHandle> {
        let mut scope = self.begin();
        match scope.acquire(entity_id, mode, deadline).await {
            Ok(lock_id) => Ok(LockHandle {
                scope,
                entity_id,
                lock_id,
                mode,
            }),
            Err(e) => {
                // Nothing is held; closing only releases the connection
                if let Err(close_err) = scope.close().await {
                    debug!(error = %close_err, "Failed to close scope after failed acquire");
                }
                Err(e)
            }
        }
    }

    async fn release_handle(&self, handle: LockHandle, mode: LockMode) -> LockResult<bool> {
        let LockHandle {
            mut scope,
            entity_id,
            mode: held_mode,
            ..
        } = handle;

        let released = if held_mode == mode {
            scope.release(entity_id, mode).await
        } else {
            warn!(
                entity_id = %entity_id,
                held = %held_mode,
                requested = %mode,
                "Release mode does not match the handle; closing its session"
            );
            Err(LockError::SessionMismatch(format!(
                "handle holds a {} lock on entity '{}', not a {} lock",
                held_mode.access(),
                entity_id,
                mode.access()
            )))
        };

        let closed = scope.close().await;
        let last = released?;
        closed?;
        Ok(last)
    }
}

/// One unit of work pinned to a single lock session
#[derive(Debug)]
pub struct LockScope {
    id: Uuid,
    resolver: Arc<LockIdResolver>,
    broker: Arc<dyn LockBroker>,
    events: broadcast::Sender<LockEvent>,
    default_deadline: Option<Duration>,
    session: Option<LockSession>,
    usages: HashMap<(EntityId, LockMode), Usage>,
    failed: bool,
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    lock_id: LockId,
    state: LockState,
}

impl LockScope {
    /// Scope identifier, carried by this scope's events
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Lifecycle state of the lock on `entity_id` in `mode`
    pub fn state(&self, entity_id: EntityId, mode: LockMode) -> LockState {
        self.usages
            .get(&(entity_id, mode))
            .map(|usage| usage.state)
            .unwrap_or(LockState::Idle)
    }

    /// Whether the scope lost its session to a broker error or expired deadline
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Entities and modes currently held
    pub fn held(&self) -> Vec<(EntityId, LockMode)> {
        self.usages
            .iter()
            .filter(|(_, usage)| usage.state == LockState::Held)
            .map(|(key, _)| *key)
            .collect()
    }

    /// Take a read lock, waiting up to the configured default deadline
    pub async fn acquire_read_lock(&mut self, entity_id: EntityId) -> LockResult<LockId> {
        self.acquire(entity_id, LockMode::Shared, self.default_deadline)
            .await
    }

    /// Take a write lock, waiting up to the configured default deadline
    pub async fn acquire_write_lock(&mut self, entity_id: EntityId) -> LockResult<LockId> {
        self.acquire(entity_id, LockMode::Exclusive, self.default_deadline)
            .await
    }

    /// Take a read lock, giving up with `LockError::Timeout` after `deadline`
    pub async fn acquire_read_lock_within(
        &mut self,
        entity_id: EntityId,
        deadline: Duration,
    ) -> LockResult<LockId> {
        self.acquire(entity_id, LockMode::Shared, Some(deadline))
            .await
    }

    /// Take a write lock, giving up with `LockError::Timeout` after `deadline`
    pub async fn acquire_write_lock_within(
        &mut self,
        entity_id: EntityId,
        deadline: Duration,
    ) -> LockResult<LockId> {
        self.acquire(entity_id, LockMode::Exclusive, Some(deadline))
            .await
    }

    /// Release one read hold on `entity_id`
    ///
    /// Returns `true` when the scope no longer holds a read lock on the entity.
    pub async fn release_read_lock(&mut self, entity_id: EntityId) -> LockResult<bool> {
        self.release(entity_id, LockMode::Shared).await
    }

    /// Release one write hold on `entity_id`
    ///
    /// Returns `true` when the scope no longer holds a write lock on the entity.
    pub async fn release_write_lock(&mut self, entity_id: EntityId) -> LockResult<bool> {
        self.release(entity_id, LockMode::Exclusive).await
    }

    /// End the unit of work, closing its session
    ///
    /// The broker releases any lock still held.
    pub async fn close(mut self) -> LockResult<()> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    async fn acquire(
        &mut self,
        entity_id: EntityId,
        mode: LockMode,
        deadline: Option<Duration>,
    ) -> LockResult<LockId> {
        if self.failed {
            return Err(self.failed_error());
        }
        let start = Instant::now();
        let expires_at = deadline.map(|deadline| start + deadline);

        let lock_id = match within(expires_at, self.resolver.resolve(entity_id)).await {
            Some(Ok(lock_id)) => lock_id,
            Some(Err(e)) => {
                warn!(entity_id = %entity_id, error = %e, "Failed to resolve lock id");
                self.publish(LockEvent::failed(self.id, entity_id, None, mode, elapsed_ms(start), &e));
                return Err(e);
            }
            None => return Err(self.expired(entity_id, None, mode, start)),
        };

        if self.session.is_none() {
            match within(expires_at, LockSession::open(self.broker.as_ref())).await {
                Some(Ok(session)) => self.session = Some(session),
                Some(Err(e)) => {
                    warn!(entity_id = %entity_id, error = %e, "Failed to open lock session");
                    self.publish(LockEvent::failed(
                        self.id,
                        entity_id,
                        Some(lock_id),
                        mode,
                        elapsed_ms(start),
                        &e,
                    ));
                    return Err(e);
                }
                None => return Err(self.expired(entity_id, Some(lock_id), mode, start)),
            }
        }

        self.transition(entity_id, mode, lock_id, LockState::Acquiring);
        debug!(
            scope_id = %self.id,
            entity_id = %entity_id,
            lock_id = %lock_id,
            mode = %mode,
            "Acquiring lock"
        );

        let outcome = {
            let mut call = BrokerCall::new(self);
            let outcome = match call.scope.session.as_mut() {
                Some(session) => {
                    let grant = async {
                        match mode {
                            LockMode::Shared => session.acquire_shared(lock_id).await,
                            LockMode::Exclusive => session.acquire_exclusive(lock_id).await,
                        }
                    };
                    within(expires_at, grant).await
                }
                None => Some(Err(call.scope.failed_error())),
            };
            call.complete();
            outcome
        };
        let elapsed = elapsed_ms(start);

        match outcome {
            Some(Ok(())) => {
                self.transition(entity_id, mode, lock_id, LockState::Held);
                info!(
                    scope_id = %self.id,
                    entity_id = %entity_id,
                    lock_id = %lock_id,
                    mode = %mode,
                    elapsed_ms = elapsed,
                    "Acquired {} lock",
                    mode.access()
                );
                self.publish(LockEvent::acquired(self.id, entity_id, lock_id, mode, elapsed));
                Ok(lock_id)
            }
            Some(Err(e)) => {
                warn!(
                    scope_id = %self.id,
                    entity_id = %entity_id,
                    lock_id = %lock_id,
                    error = %e,
                    "Broker failed to grant lock; discarding session"
                );
                self.fail();
                self.publish(LockEvent::failed(self.id, entity_id, Some(lock_id), mode, elapsed, &e));
                Err(e)
            }
            None => {
                self.fail();
                Err(self.expired(entity_id, Some(lock_id), mode, start))
            }
        }
    }

    async fn release(&mut self, entity_id: EntityId, mode: LockMode) -> LockResult<bool> {
        if self.failed {
            return Err(self.failed_error());
        }

        let lock_id = match self.usages.get(&(entity_id, mode)) {
            Some(usage) if usage.state == LockState::Held => usage.lock_id,
            _ => {
                return Err(LockError::SessionMismatch(format!(
                    "scope {} does not hold a {} lock on entity '{}'",
                    self.id,
                    mode.access(),
                    entity_id
                )));
            }
        };

        let start = Instant::now();
        self.transition(entity_id, mode, lock_id, LockState::Releasing);

        let outcome = {
            let mut call = BrokerCall::new(self);
            let outcome = match call.scope.session.as_mut() {
                Some(session) => {
                    let result = match mode {
                        LockMode::Shared => session.release_shared(lock_id).await,
                        LockMode::Exclusive => session.release_exclusive(lock_id).await,
                    };
                    result.map(|last| (last, session.holds(lock_id, mode)))
                }
                None => Err(call.scope.failed_error()),
            };
            call.complete();
            outcome
        };
        let elapsed = elapsed_ms(start);

        match outcome {
            Ok((last, still_held)) => {
                let next = if still_held {
                    LockState::Held
                } else {
                    LockState::Idle
                };
                self.transition(entity_id, mode, lock_id, next);
                info!(
                    scope_id = %self.id,
                    entity_id = %entity_id,
                    lock_id = %lock_id,
                    mode = %mode,
                    elapsed_ms = elapsed,
                    "Released {} lock",
                    mode.access()
                );
                self.publish(LockEvent::released(self.id, entity_id, lock_id, mode, elapsed, last));
                Ok(last)
            }
            Err(e) => {
                warn!(
                    scope_id = %self.id,
                    entity_id = %entity_id,
                    lock_id = %lock_id,
                    error = %e,
                    "Broker release failed; discarding session"
                );
                self.fail();
                self.publish(LockEvent::failed(self.id, entity_id, Some(lock_id), mode, elapsed, &e));
                Err(e)
            }
        }
    }

    /// Report an expired deadline
    ///
    /// Expiry before the broker call leaves the session untouched; the caller
    /// fails the scope when the broker call itself was interrupted.
    fn expired(
        &self,
        entity_id: EntityId,
        lock_id: Option<LockId>,
        mode: LockMode,
        start: Instant,
    ) -> LockError {
        let waited_ms = elapsed_ms(start);
        warn!(
            scope_id = %self.id,
            entity_id = %entity_id,
            lock_id = ?lock_id.map(LockId::get),
            mode = %mode,
            waited_ms,
            "Lock deadline expired"
        );
        self.publish(LockEvent::timed_out(self.id, entity_id, lock_id, mode, waited_ms));
        LockError::Timeout {
            entity_id,
            waited_ms,
        }
    }

    fn transition(&mut self, entity_id: EntityId, mode: LockMode, lock_id: LockId, next: LockState) {
        let usage = self.usages.entry((entity_id, mode)).or_insert(Usage {
            lock_id,
            state: LockState::Idle,
        });
        debug_assert!(
            usage.state.can_transition_to(next),
            "illegal lock state transition {} -> {}",
            usage.state,
            next
        );
        usage.state = next;
    }

    /// Discard the session and mark every live usage failed
    fn fail(&mut self) {
        if let Some(session) = self.session.take() {
            session.discard();
        }
        for usage in self.usages.values_mut() {
            if usage.state.can_transition_to(LockState::Failed) {
                usage.state = LockState::Failed;
            }
        }
        self.failed = true;
    }

    fn failed_error(&self) -> LockError {
        LockError::SessionMismatch(format!(
            "scope {} failed and its session was discarded; its locks are no longer held",
            self.id
        ))
    }

    fn publish(&self, event: LockEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

/// A broker call in progress on a scope's session
///
/// If the call's future is dropped before `complete`, the session's state is
/// unknown: the lock may or may not have been granted or released. Dropping
/// the guard then fails the scope, which discards the session so the broker
/// frees everything it held.
struct BrokerCall<'a> {
    scope: &'a mut LockScope,
    completed: bool,
}

impl<'a> BrokerCall<'a> {
    fn new(scope: &'a mut LockScope) -> Self {
        Self {
            scope,
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for BrokerCall<'_> {
    fn drop(&mut self) {
        if !self.completed {
            warn!(scope_id = %self.scope.id, "Lock call cancelled; discarding session");
            self.scope.fail();
        }
    }
}

/// Run `fut` to completion, or until `expires_at` passes
async fn within<F: Future>(expires_at: Option<Instant>, fut: F) -> Option<F::Output> {
    match expires_at {
        Some(at) => timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// A scope holding exactly one lock
///
/// Returned by the service's single-lock acquire calls. Hand it back to the
/// matching release call; dropping it closes the session, which makes the
/// broker release the lock.
#[derive(Debug)]
#[must_use = "dropping a LockHandle releases its lock"]
pub struct LockHandle {
    scope: LockScope,
    entity_id: EntityId,
    lock_id: LockId,
    mode: LockMode,
}

impl LockHandle {
    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Identifier of the scope holding the lock
    pub fn scope_id(&self) -> Uuid {
        self.scope.id()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}
