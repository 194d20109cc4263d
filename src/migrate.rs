//! Bookkeeping schema.
//!
//! Creates the fixed tables the mirror needs. Materialized `src_*` tables
//! are created on demand by [`crate::schema`], not here. Every statement is
//! idempotent, so running migrations on each open is safe.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Open the configured database, apply migrations and close it again.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply migrations on an existing pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Binding registry: one row per mirrored source table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_tables (
            source_table_id TEXT PRIMARY KEY,
            local_table_name TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            schema_fingerprint TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_synced_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Binding registry: slug -> column, append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_columns (
            source_table_id TEXT NOT NULL,
            field_slug TEXT NOT NULL,
            column_name TEXT NOT NULL,
            kind TEXT NOT NULL,
            position INTEGER NOT NULL,
            PRIMARY KEY (source_table_id, field_slug),
            FOREIGN KEY (source_table_id) REFERENCES cache_tables(source_table_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_freshness (
            scope TEXT PRIMARY KEY,
            last_synced_at INTEGER,
            expires_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_performance (
            source_table_id TEXT PRIMARY KEY,
            hits INTEGER NOT NULL DEFAULT 0,
            misses INTEGER NOT NULL DEFAULT 0,
            last_access_at INTEGER,
            record_count INTEGER NOT NULL DEFAULT 0,
            size_estimate INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Cached remote table list (the "tables" scope)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_source_tables (
            source_table_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            listed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_cache_columns_table ON cache_columns(source_table_id, position)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
