//! Entity id -> lock id resolution
//!
//! Resolution goes cache, then store lookup, then insert. When two callers
//! race to create the mapping for a new entity, the store's uniqueness
//! constraint picks the winner and the loser re-reads the winner's row.
//! The cache lock is never held across a store round-trip.

use crate::error::{LockError, LockResult};
use crate::store::MappingStore;
use crate::types::{EntityId, LockId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resolves entity ids to lock ids through a write-through cache
#[derive(Debug)]
pub struct LockIdResolver {
    store: Arc<dyn MappingStore>,
    cache: RwLock<HashMap<EntityId, LockId>>,
}

impl LockIdResolver {
    pub fn new(store: Arc<dyn MappingStore>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// The backing mapping store
    pub fn store(&self) -> &Arc<dyn MappingStore> {
        &self.store
    }

    /// Resolve the lock id for an entity, creating the mapping on first use
    ///
    /// Idempotent: every call for the same entity returns the same lock id,
    /// from this or any other resolver sharing the store. Fails with
    /// `StorageUnavailable` when the store cannot be reached, in which case
    /// nothing is cached.
    pub async fn resolve(&self, entity_id: EntityId) -> LockResult<LockId> {
        if let Some(lock_id) = self.peek(entity_id).await {
            return Ok(lock_id);
        }

        let start = Instant::now();
        if let Some(lock_id) = self.store.find(entity_id).await? {
            debug!(entity_id = %entity_id, lock_id = %lock_id, "Loaded lock id from store");
            return Ok(self.remember(entity_id, lock_id).await);
        }

        let lock_id = match self.store.insert(entity_id).await {
            Ok(lock_id) => {
                debug!(
                    entity_id = %entity_id,
                    lock_id = %lock_id,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Created lock id mapping"
                );
                lock_id
            }
            Err(LockError::MappingConflict(_)) => {
                warn!(entity_id = %entity_id, "Lost lock id creation race, reading winner's mapping");
                self.store.find(entity_id).await?.ok_or_else(|| {
                    LockError::StorageUnavailable(format!(
                        "mapping for entity '{}' conflicted on insert but is not readable",
                        entity_id
                    ))
                })?
            }
            Err(e) => return Err(e),
        };

        Ok(self.remember(entity_id, lock_id).await)
    }

    /// Cache-only lookup
    pub async fn peek(&self, entity_id: EntityId) -> Option<LockId> {
        self.cache.read().await.get(&entity_id).copied()
    }

    /// Number of cached mappings
    pub async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Insert into the cache; the first value written for a key wins
    async fn remember(&self, entity_id: EntityId, lock_id: LockId) -> LockId {
        let mut cache = self.cache.write().await;
        let cached = *cache.entry(entity_id).or_insert(lock_id);
        if cached != lock_id {
            // Unreachable while the store keeps entity_id unique
            warn!(
                entity_id = %entity_id,
                cached = %cached,
                loaded = %lock_id,
                "Store returned a different lock id than the cache holds"
            );
        }
        cached
    }
}
