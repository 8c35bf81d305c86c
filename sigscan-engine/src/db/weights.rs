//! Weight vector versions

use super::format_timestamp;
use crate::types::WeightVector;
use sigscan_common::Result;
use sqlx::{Row, SqlitePool};

/// Store a published version; versions are immutable once written
pub async fn insert_version(pool: &SqlitePool, vector: &WeightVector, origin: &str) -> Result<()> {
    let weights = serde_json::to_string(vector)?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO weight_versions (version, weights, effective_from, origin, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(vector.version() as i64)
    .bind(&weights)
    .bind(format_timestamp(vector.effective_from()))
    .bind(origin)
    .bind(format_timestamp(sigscan_common::time::now()))
    .execute(pool)
    .await?;

    Ok(())
}

/// Every stored version, oldest first. Rows that fail validation are an error.
pub async fn load_versions(pool: &SqlitePool) -> Result<Vec<WeightVector>> {
    let rows = sqlx::query("SELECT weights FROM weight_versions ORDER BY version")
        .fetch_all(pool)
        .await?;

    rows.into_iter()
        .map(|row| {
            let weights: String = row.get("weights");
            Ok(serde_json::from_str(&weights)?)
        })
        .collect()
}
