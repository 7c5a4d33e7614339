//! PostgreSQL mapping store

use super::{MappingStore, MigrationStatus, insert_error, migration_error, migrations};
use crate::error::{LockError, LockResult};
use crate::types::{EntityId, LockId};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

/// Mapping store backed by a PostgreSQL connection pool
///
/// The pool only serves mapping lookups and inserts. Advisory locks are never
/// taken on pooled connections; see `broker::postgres`.
#[derive(Debug, Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    /// Connect a pool and optionally bring the schema up to date
    pub async fn connect(url: &str, max_connections: u32, auto_migrate: bool) -> LockResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        let store = Self { pool };
        if auto_migrate {
            store.migrate().await?;
        }
        Ok(store)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MappingStore for PgMappingStore {
    async fn find(&self, entity_id: EntityId) -> LockResult<Option<LockId>> {
        let lock_id: Option<i64> =
            sqlx::query_scalar("SELECT lock_id FROM entityid_to_lockid WHERE entity_id = $1")
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(lock_id.map(LockId::new))
    }

    async fn insert(&self, entity_id: EntityId) -> LockResult<LockId> {
        // ON CONFLICT turns the common race into "no row returned"; the unique
        // violation path in insert_error covers anything that slips past it.
        let lock_id: Option<i64> = sqlx::query_scalar(
            "INSERT INTO entityid_to_lockid (entity_id) VALUES ($1) \
             ON CONFLICT (entity_id) DO NOTHING RETURNING lock_id",
        )
        .bind(entity_id)
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
        migrations::run_postgres_migrations(&self.pool)
            .await
            .map_err(migration_error)
    }

    async fn migration_status(&self) -> LockResult<MigrationStatus> {
        migrations::postgres_migration_status(&self.pool)
            .await
            .map_err(migration_error)
    }
}
