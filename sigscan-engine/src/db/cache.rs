//! Durable cache tier storage

use super::{format_timestamp, parse_timestamp};
use crate::cache::entry::{CacheEntry, CacheKey};
use crate::fetch::FetchedSignal;
use sqlx::{Row, SqlitePool};
use sigscan_common::Result;
use std::time::Duration;

/// Write an entry unless a newer one is already stored
///
/// Returns false when the stored entry was fetched later than `entry`.
pub async fn upsert_entry(pool: &SqlitePool, entry: &CacheEntry) -> Result<bool> {
    let payload = serde_json::to_string(&entry.signal)?;
    let fetched_at = format_timestamp(entry.fetched_at);

    let result = sqlx::query(
        r#"
        INSERT INTO cache_entries (
            source, identifier, data_class, payload, fetched_at, ttl_ms, ceiling_ms
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(source, identifier, data_class) DO UPDATE SET
            payload = excluded.payload,
            fetched_at = excluded.fetched_at,
            ttl_ms = excluded.ttl_ms,
            ceiling_ms = excluded.ceiling_ms
        WHERE excluded.fetched_at >= cache_entries.fetched_at
        "#,
    )
    .bind(entry.key.source.as_str())
    .bind(entry.key.identifier.as_str())
    .bind(entry.key.data_class.as_str())
    .bind(&payload)
    .bind(&fetched_at)
    .bind(entry.ttl.as_millis() as i64)
    .bind(entry.hard_ceiling.as_millis() as i64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Every stored entry
pub async fn load_entries(pool: &SqlitePool) -> Result<Vec<CacheEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT source, identifier, data_class, payload, fetched_at, ttl_ms, ceiling_ms
        FROM cache_entries
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let source: String = row.get("source");
        let identifier: String = row.get("identifier");
        let data_class: String = row.get("data_class");
        let payload: String = row.get("payload");
        let fetched_at: String = row.get("fetched_at");
        let ttl_ms: i64 = row.get("ttl_ms");
        let ceiling_ms: i64 = row.get("ceiling_ms");

        let signal: FetchedSignal = serde_json::from_str(&payload)?;
        entries.push(CacheEntry {
            key: CacheKey {
                source: source.into(),
                identifier: identifier.into(),
                data_class: data_class.into(),
            },
            signal,
            fetched_at: parse_timestamp("cache_entries.fetched_at", &fetched_at)?,
            ttl: Duration::from_millis(ttl_ms.max(0) as u64),
            hard_ceiling: Duration::from_millis(ceiling_ms.max(0) as u64),
        });
    }

    Ok(entries)
}

pub async fn delete_entry(pool: &SqlitePool, key: &CacheKey) -> Result<()> {
    sqlx::query("DELETE FROM cache_entries WHERE source = ? AND identifier = ? AND data_class = ?")
        .bind(key.source.as_str())
        .bind(key.identifier.as_str())
        .bind(key.data_class.as_str())
        .execute(pool)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalReading;
    use chrono::{Duration as ChronoDuration, Utc};
    use sigscan_common::db::init_memory_database;

    fn entry(score: f64, fetched_at: chrono::DateTime<Utc>) -> CacheEntry {
        CacheEntry {
            key: CacheKey {
                source: "alpha".into(),
                identifier: "ACME".into(),
                data_class: "insider".into(),
            },
            signal: FetchedSignal {
                reading: SignalReading::new(score),
                served_by: "alpha".into(),
                upstream_stale: false,
            },
            fetched_at,
            ttl: Duration::from_secs(60),
            hard_ceiling: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn test_upsert_is_monotonic() {
        let pool = init_memory_database().await.unwrap();
        let t0 = Utc::now();

        assert!(upsert_entry(&pool, &entry(10.0, t0)).await.unwrap());
        assert!(upsert_entry(&pool, &entry(20.0, t0 + ChronoDuration::seconds(5))).await.unwrap());
        // Older write loses
        assert!(!upsert_entry(&pool, &entry(30.0, t0)).await.unwrap());

        let loaded = load_entries(&pool).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].signal.reading.score, 20.0);
        assert_eq!(loaded[0].hard_ceiling, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let pool = init_memory_database().await.unwrap();
        let e = entry(10.0, Utc::now());
        upsert_entry(&pool, &e).await.unwrap();
        delete_entry(&pool, &e.key).await.unwrap();
        assert!(load_entries(&pool).await.unwrap().is_empty());
    }
}
