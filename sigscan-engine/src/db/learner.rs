//! Learner state records
//!
//! Append-only: each transition adds a row and the newest row wins.

use super::{format_timestamp, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sigscan_common::Result;
use sqlx::{Row, SqlitePool};

pub async fn append_state<S: Serialize>(
    pool: &SqlitePool,
    stage: &str,
    state: &S,
    recorded_at: DateTime<Utc>,
) -> Result<i64> {
    let state = serde_json::to_string(state)?;

    let result = sqlx::query("INSERT INTO learner_state (stage, state, recorded_at) VALUES (?, ?, ?)")
        .bind(stage)
        .bind(&state)
        .bind(format_timestamp(recorded_at))
        .execute(pool)
        .await?;

    Ok(result.last_insert_rowid())
}

/// Newest state record, if any
pub async fn load_latest<S: DeserializeOwned>(pool: &SqlitePool) -> Result<Option<(S, DateTime<Utc>)>> {
    let row = sqlx::query("SELECT state, recorded_at FROM learner_state ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let state: String = row.get("state");
            let recorded_at: String = row.get("recorded_at");
            Ok(Some((
                serde_json::from_str(&state)?,
                parse_timestamp("learner_state.recorded_at", &recorded_at)?,
            )))
        }
        None => Ok(None),
    }
}

/// Stage names of the most recent transitions, newest first
pub async fn recent_stages(pool: &SqlitePool, limit: i64) -> Result<Vec<String>> {
    let rows = sqlx::query("SELECT stage FROM learner_state ORDER BY id DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|row| row.get("stage")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use sigscan_common::db::init_memory_database;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct StoredCounter {
        n: u32,
    }

    #[tokio::test]
    async fn test_newest_record_wins() {
        let pool = init_memory_database().await.unwrap();
        assert!(load_latest::<StoredCounter>(&pool).await.unwrap().is_none());

        append_state(&pool, "active", &StoredCounter { n: 1 }, Utc::now()).await.unwrap();
        append_state(&pool, "shadow_evaluating", &StoredCounter { n: 2 }, Utc::now()).await.unwrap();

        let (latest, _) = load_latest::<StoredCounter>(&pool).await.unwrap().unwrap();
        assert_eq!(latest, StoredCounter { n: 2 });
        assert_eq!(
            recent_stages(&pool, 5).await.unwrap(),
            vec!["shadow_evaluating".to_string(), "active".to_string()]
        );
    }
}
