//! Persistent entity id -> lock id mapping
//!
//! # Architecture
//!
//! - `postgres`: production store, shares the database with the lock broker
//! - `sqlite`: embedded single-host store, also used by tests
//! - `migrations`: schema versioning for both backends
//!
//! The table holds one row per entity. `entity_id` is unique and `lock_id` is
//! assigned by the database from a monotonically increasing sequence. Rows are
//! never updated or deleted.

pub mod migrations;
pub mod postgres;
pub mod sqlite;

use crate::config::{Backend, DatabaseConfig};
use crate::error::{LockError, LockResult};
use crate::types::{EntityId, LockId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub use migrations::MigrationStatus;
pub use postgres::PgMappingStore;
pub use sqlite::SqliteMappingStore;

/// Name of the mapping table
pub const MAPPING_TABLE: &str = "entityid_to_lockid";

/// Durable entity id -> lock id mapping
#[async_trait]
pub trait MappingStore: Send + Sync + fmt::Debug {
    /// Look up the lock id assigned to an entity
    async fn find(&self, entity_id: EntityId) -> LockResult<Option<LockId>>;

    /// Insert a mapping row and return the lock id the store assigned
    ///
    /// Returns `LockError::MappingConflict` if a row for `entity_id` already
    /// exists. The insert is a single statement, so a failure never leaves a
    /// partial row behind.
    async fn insert(&self, entity_id: EntityId) -> LockResult<LockId>;

    /// Number of persisted mappings
    async fn count(&self) -> LockResult<u64>;

    /// Check that the store is reachable
    async fn health_check(&self) -> LockResult<()>;

    /// Apply pending schema migrations
    async fn migrate(&self) -> LockResult<()>;

    /// Schema version applied to the store
    async fn migration_status(&self) -> LockResult<MigrationStatus>;
}

/// Open the mapping store selected by the configured URL
pub async fn connect(config: &DatabaseConfig) -> LockResult<Arc<dyn MappingStore>> {
    let backend = config
        .backend()
        .map_err(|e| LockError::Config(e.to_string()))?;
    let url = config.resolved_url();

    let store: Arc<dyn MappingStore> = match backend {
        Backend::Postgres => Arc::new(
            PgMappingStore::connect(&url, config.max_connections, config.auto_migrate).await?,
        ),
        Backend::Sqlite => Arc::new(
            SqliteMappingStore::connect(&url, config.max_connections, config.auto_migrate).await?,
        ),
    };
    Ok(store)
}

/// Wrap a migration failure
pub(crate) fn migration_error(err: anyhow::Error) -> LockError {
    LockError::StorageUnavailable(format!("Failed to run migrations: {:#}", err))
}

/// Classify an insert failure: unique violations become `MappingConflict`
pub(crate) fn insert_error(entity_id: EntityId, err: sqlx::Error) -> LockError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            LockError::MappingConflict(entity_id)
        }
        _ => LockError::from(err),
    }
}
