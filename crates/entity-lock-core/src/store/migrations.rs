//! Database migrations
//!
//! Versioned schema migrations for the mapping store, applied on connect when
//! `database.auto_migrate` is set. Every statement is idempotent. On
//! PostgreSQL, concurrent `CREATE TABLE IF NOT EXISTS` can still collide in
//! the catalog, so each bootstrap runs in a transaction holding a
//! transaction-scoped advisory lock and processes take turns.

use serde::Serialize;
use sqlx::postgres::PgConnection;
use sqlx::{Executor, PgPool, Postgres, SqlitePool, Transaction};

/// Current schema version
pub const CURRENT_VERSION: i32 = 1;

/// Advisory key serializing PostgreSQL bootstraps, as (class, object)
///
/// The two-key form lives in a separate key space from the single `bigint`
/// keys used for entity locks, so it never blocks or is blocked by one.
const MIGRATION_LOCK_KEY: (i32, i32) = (0x454c_4b4d, 1);

const CREATE_MIGRATIONS_TABLE_PG: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
"#;

const CREATE_MIGRATIONS_TABLE_SQLITE: &str = r#"
    CREATE TABLE IF NOT EXISTS _migrations (
        version INTEGER PRIMARY KEY NOT NULL,
        applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
"#;

/// Migration 1 (PostgreSQL): entity id -> lock id mapping
const MIGRATION_V1_PG: &str = r#"
    CREATE TABLE IF NOT EXISTS entityid_to_lockid (
        entity_id UUID PRIMARY KEY NOT NULL,
        lock_id BIGINT GENERATED BY DEFAULT AS IDENTITY NOT NULL UNIQUE
    );
"#;

/// Migration 1 (SQLite): lock_id must be the rowid to auto-increment, so the
/// entity id carries the unique constraint instead of the primary key
const MIGRATION_V1_SQLITE: &str = r#"
    CREATE TABLE IF NOT EXISTS entityid_to_lockid (
        lock_id INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_id TEXT NOT NULL UNIQUE
    );
"#;

/// Migration status information
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Current schema version in the database
    pub current_version: i32,
    /// Target schema version (latest)
    pub target_version: i32,
    /// Whether migrations need to be run
    pub needs_migration: bool,
}

impl MigrationStatus {
    fn new(current_version: i32) -> Self {
        Self {
            current_version,
            target_version: CURRENT_VERSION,
            needs_migration: current_version < CURRENT_VERSION,
        }
    }
}

/// Run all pending PostgreSQL migrations
pub async fn run_postgres_migrations(pool: &PgPool) -> anyhow::Result<()> {
    let mut tx = begin_postgres_bootstrap(pool).await?;
    let current_version = postgres_version(&mut *tx).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking mapping store migrations"
    );

    if current_version >= CURRENT_VERSION {
        tx.commit().await?;
        tracing::debug!("Mapping store is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: entity id to lock id mapping");
        (&mut *tx).execute(sqlx::raw_sql(MIGRATION_V1_PG)).await?;
        sqlx::query("INSERT INTO _migrations (version) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(1)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    tracing::info!("Mapping store migrations completed");
    Ok(())
}

/// Run all pending SQLite migrations
pub async fn run_sqlite_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let current_version = sqlite_version(pool).await?;

    tracing::info!(
        current_version = current_version,
        target_version = CURRENT_VERSION,
        "Checking mapping store migrations"
    );

    if current_version >= CURRENT_VERSION {
        tracing::debug!("Mapping store is up to date");
        return Ok(());
    }

    if current_version < 1 {
        tracing::info!("Applying migration v1: entity id to lock id mapping");
        sqlx::raw_sql(MIGRATION_V1_SQLITE).execute(pool).await?;
        sqlx::query("INSERT OR IGNORE INTO _migrations (version) VALUES (?)")
            .bind(1)
            .execute(pool)
            .await?;
    }

    tracing::info!("Mapping store migrations completed");
    Ok(())
}

/// Get PostgreSQL migration status
pub async fn postgres_migration_status(pool: &PgPool) -> anyhow::Result<MigrationStatus> {
    let mut tx = begin_postgres_bootstrap(pool).await?;
    let version = postgres_version(&mut *tx).await?;
    tx.commit().await?;
    Ok(MigrationStatus::new(version))
}

/// Get SQLite migration status
pub async fn sqlite_migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    Ok(MigrationStatus::new(sqlite_version(pool).await?))
}

/// Open a transaction holding the bootstrap lock until commit or rollback
async fn begin_postgres_bootstrap(pool: &PgPool) -> anyhow::Result<Transaction<'static, Postgres>> {
    let mut tx = pool.begin().await?;
    let (class, object) = MIGRATION_LOCK_KEY;
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(class)
        .bind(object)
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

async fn postgres_version(conn: &mut PgConnection) -> anyhow::Result<i32> {
    (&mut *conn)
        .execute(sqlx::raw_sql(CREATE_MIGRATIONS_TABLE_PG))
        .await?;

    let version: i32 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM _migrations")
        .fetch_one(&mut *conn)
        .await?;
    Ok(version)
}

async fn sqlite_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(CREATE_MIGRATIONS_TABLE_SQLITE)
        .execute(pool)
        .await?;

    let version: i32 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM _migrations")
        .fetch_one(pool)
        .await?;
    Ok(version)
}
