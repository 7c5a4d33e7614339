//! SQLite mapping store
//!
//! Suitable for a single host. Entity ids are stored as hyphenated text.

use super::{MappingStore, MigrationStatus, insert_error, migration_error, migrations};
use crate::error::{LockError, LockResult};
use crate::types::{EntityId, LockId};
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use tracing::debug;

/// Mapping store backed by a SQLite connection pool
#[derive(Debug, Clone)]
pub struct SqliteMappingStore {
    pool: SqlitePool,
}

impl SqliteMappingStore {
    /// Connect a pool and optionally bring the schema up to date
    ///
    /// In-memory databases are private to each connection, so the pool is
    /// capped at one connection for them.
    pub async fn connect(url: &str, max_connections: u32, auto_migrate: bool) -> LockResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let max_connections = if in_memory { 1 } else { max_connections };

        let mut options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        if !in_memory {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            // The database lives only as long as its connection
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        let store = Self { pool };
        if auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Create a migrated in-memory store (useful for testing)
    pub async fn in_memory() -> LockResult<Self> {
        Self::connect("sqlite::memory:", 1, true).await
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MappingStore for SqliteMappingStore {
    async fn find(&self, entity_id: EntityId) -> LockResult<Option<LockId>> {
        let lock_id: Option<i64> =
            sqlx::query_scalar("SELECT lock_id FROM entityid_to_lockid WHERE entity_id = ?")
                .bind(entity_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(lock_id.map(LockId::new))
    }

    async fn insert(&self, entity_id: EntityId) -> LockResult<LockId> {
        let lock_id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO entityid_to_lockid (entity_id) VALUES (?) \
             ON CONFLICT (entity_id) DO NOTHING RETURNING lock_id",
        )
        .bind(entity_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| insert_error(entity_id, e))?;

        match lock_id {
            Some(id) => {
                debug!(entity_id = %entity_id, lock_id = id, "Inserted lock id mapping");
                Ok(LockId::new(id))
            }
            None => Err(LockError::MappingConflict(entity_id)),
        }
    }

    async fn count(&self) -> LockResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entityid_to_lockid")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> LockResult<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn migrate(&self) -> LockResult<()> {
        migrations::run_sqlite_migrations(&self.pool)
            .await
            .map_err(migration_error)
    }

    async fn migration_status(&self) -> LockResult<MigrationStatus> {
        migrations::sqlite_migration_status(&self.pool)
            .await
            .map_err(migration_error)
    }
}
