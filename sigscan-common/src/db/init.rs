//! Database initialization
//!
//! Creates the database file on first run and applies the schema. Every
//! table creation is idempotent, so opening an existing database is the same
//! call as creating a new one.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::{info, warn};

/// Current schema version
///
/// Increment when a table definition changes.
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// Open (or create) the database at `db_path` and apply the schema
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL lets the scan path read while the learner writes
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database with the full schema.
///
/// A single connection is used because every SQLite in-memory connection is
/// its own database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Apply every table definition and record the schema version
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_weight_versions_table(pool).await?;
    create_learner_state_table(pool).await?;
    create_cache_entries_table(pool).await?;
    create_emissions_table(pool).await?;
    create_outcomes_table(pool).await?;
    create_scans_table(pool).await?;
    record_schema_version(pool).await
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn record_schema_version(pool: &SqlitePool) -> Result<()> {
    let stored: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
            .fetch_one(pool)
            .await?;

    match stored {
        Some(v) if v == CURRENT_SCHEMA_VERSION => {}
        Some(v) if v > CURRENT_SCHEMA_VERSION => {
            warn!(
                "Database schema version ({}) is newer than code version ({})",
                v, CURRENT_SCHEMA_VERSION
            );
        }
        _ => {
            sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
                .bind(CURRENT_SCHEMA_VERSION)
                .execute(pool)
                .await?;
            info!("Database schema at v{}", CURRENT_SCHEMA_VERSION);
        }
    }

    Ok(())
}

/// Every weight vector ever published, keyed by its monotonic version
async fn create_weight_versions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS weight_versions (
            version INTEGER PRIMARY KEY,
            weights TEXT NOT NULL,
            effective_from TIMESTAMP NOT NULL,
            origin TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only learner snapshots; the newest row is the live state
async fn create_learner_state_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS learner_state (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stage TEXT NOT NULL,
            state TEXT NOT NULL,
            recorded_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_cache_entries_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cache_entries (
            source TEXT NOT NULL,
            identifier TEXT NOT NULL,
            data_class TEXT NOT NULL,
            payload TEXT NOT NULL,
            fetched_at TIMESTAMP NOT NULL,
            ttl_ms INTEGER NOT NULL,
            ceiling_ms INTEGER NOT NULL,
            PRIMARY KEY (source, identifier, data_class)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Results handed out by scans, visible and shadow, awaiting outcomes
async fn create_emissions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS emissions (
            scan_id TEXT NOT NULL,
            identifier TEXT NOT NULL,
            weight_version INTEGER NOT NULL,
            visible INTEGER NOT NULL,
            raw_score REAL NOT NULL,
            tier TEXT NOT NULL,
            contributions TEXT NOT NULL,
            generated_at TIMESTAMP NOT NULL,
            PRIMARY KEY (scan_id, identifier, weight_version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_outcomes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outcomes (
            scan_id TEXT NOT NULL,
            identifier TEXT NOT NULL,
            horizon_secs INTEGER NOT NULL,
            weight_version INTEGER NOT NULL,
            realized_return REAL NOT NULL,
            label TEXT NOT NULL,
            recorded_at TIMESTAMP NOT NULL,
            PRIMARY KEY (scan_id, identifier, horizon_secs)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_scans_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scans (
            scan_id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            requested INTEGER NOT NULL,
            completed INTEGER NOT NULL,
            completion_ratio REAL NOT NULL,
            started_at TIMESTAMP NOT NULL,
            finished_at TIMESTAMP,
            report TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
