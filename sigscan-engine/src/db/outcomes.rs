//! Emission and outcome records

use super::{format_timestamp, parse_timestamp};
use crate::outcomes::Emission;
use crate::types::{OutcomeLabel, OutcomeRecord, Recommendation};
use chrono::{DateTime, Utc};
use sigscan_common::{Error, Result};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use uuid::Uuid;

pub async fn insert_emission(pool: &SqlitePool, emission: &Emission) -> Result<()> {
    let contributions = serde_json::to_string(&emission.contributions)?;

    sqlx::query(
        r#"
        INSERT OR IGNORE INTO emissions (
            scan_id, identifier, weight_version, visible, raw_score, tier, contributions, generated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(emission.scan_id.to_string())
    .bind(emission.identifier.as_str())
    .bind(emission.weight_version as i64)
    .bind(emission.visible)
    .bind(emission.raw_score)
    .bind(emission.tier.as_str())
    .bind(&contributions)
    .bind(format_timestamp(emission.generated_at))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_emissions(pool: &SqlitePool) -> Result<Vec<Emission>> {
    let rows = sqlx::query(
        r#"
        SELECT scan_id, identifier, weight_version, visible, raw_score, tier, contributions, generated_at
        FROM emissions
        ORDER BY generated_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let scan_id: String = row.get("scan_id");
            let identifier: String = row.get("identifier");
            let weight_version: i64 = row.get("weight_version");
            let tier: String = row.get("tier");
            let contributions: String = row.get("contributions");
            let generated_at: String = row.get("generated_at");

            Ok(Emission {
                scan_id: parse_uuid(&scan_id)?,
                identifier: identifier.into(),
                weight_version: weight_version as u64,
                visible: row.get("visible"),
                raw_score: row.get("raw_score"),
                tier: Recommendation::parse(&tier)
                    .ok_or_else(|| Error::CorruptRecord(format!("Unknown tier '{}'", tier)))?,
                contributions: serde_json::from_str(&contributions)?,
                generated_at: parse_timestamp("emissions.generated_at", &generated_at)?,
            })
        })
        .collect()
}

pub async fn insert_outcome(pool: &SqlitePool, record: &OutcomeRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outcomes (
            scan_id, identifier, horizon_secs, weight_version, realized_return, label, recorded_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.scan_id.to_string())
    .bind(record.identifier.as_str())
    .bind(record.horizon.as_secs() as i64)
    .bind(record.weight_version as i64)
    .bind(record.realized_return)
    .bind(record.label.as_str())
    .bind(format_timestamp(record.recorded_at))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_outcomes(pool: &SqlitePool) -> Result<Vec<OutcomeRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT scan_id, identifier, horizon_secs, weight_version, realized_return, label, recorded_at
        FROM outcomes
        ORDER BY recorded_at
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let scan_id: String = row.get("scan_id");
            let identifier: String = row.get("identifier");
            let horizon_secs: i64 = row.get("horizon_secs");
            let weight_version: i64 = row.get("weight_version");
            let label: String = row.get("label");
            let recorded_at: String = row.get("recorded_at");

            Ok(OutcomeRecord {
                identifier: identifier.into(),
                scan_id: parse_uuid(&scan_id)?,
                weight_version: weight_version as u64,
                horizon: Duration::from_secs(horizon_secs.max(0) as u64),
                realized_return: row.get("realized_return"),
                label: OutcomeLabel::parse(&label)
                    .ok_or_else(|| Error::CorruptRecord(format!("Unknown outcome label '{}'", label)))?,
                recorded_at: parse_timestamp("outcomes.recorded_at", &recorded_at)?,
            })
        })
        .collect()
}

/// Delete (scan, identifier) groups whose newest emission predates `cutoff`,
/// then every outcome left without an emission
pub async fn prune_before(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<(u64, u64)> {
    let emissions = sqlx::query(
        r#"
        DELETE FROM emissions
        WHERE (scan_id, identifier) IN (
            SELECT scan_id, identifier FROM emissions
            GROUP BY scan_id, identifier
            HAVING MAX(generated_at) < ?
        )
        "#,
    )
    .bind(format_timestamp(cutoff))
    .execute(pool)
    .await?
    .rows_affected();

    let outcomes = sqlx::query(
        r#"
        DELETE FROM outcomes
        WHERE NOT EXISTS (
            SELECT 1 FROM emissions e
            WHERE e.scan_id = outcomes.scan_id AND e.identifier = outcomes.identifier
        )
        "#,
    )
    .execute(pool)
    .await?
    .rows_affected();

    Ok((emissions, outcomes))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| Error::CorruptRecord(format!("Invalid scan id '{}': {}", value, e)))
}
