//! Scan summaries

use super::format_timestamp;
use crate::types::ScanReport;
use sigscan_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Insert or update the summary row for a scan, with its full report
pub async fn save_scan(pool: &SqlitePool, report: &ScanReport) -> Result<()> {
    let body = serde_json::to_string(report)?;

    sqlx::query(
        r#"
        INSERT INTO scans (
            scan_id, mode, status, requested, completed, completion_ratio, started_at, finished_at, report
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(scan_id) DO UPDATE SET
            status = excluded.status,
            completed = excluded.completed,
            completion_ratio = excluded.completion_ratio,
            finished_at = excluded.finished_at,
            report = excluded.report
        "#,
    )
    .bind(report.scan_id.to_string())
    .bind(report.mode.as_str())
    .bind(report.status.as_str())
    .bind(report.requested as i64)
    .bind(report.completed as i64)
    .bind(report.completion_ratio)
    .bind(format_timestamp(report.started_at))
    .bind(report.finished_at.map(format_timestamp))
    .bind(&body)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn load_scan(pool: &SqlitePool, scan_id: Uuid) -> Result<Option<ScanReport>> {
    let row = sqlx::query("SELECT report FROM scans WHERE scan_id = ?")
        .bind(scan_id.to_string())
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let body: Option<String> = row.get("report");
            match body {
                Some(body) => Ok(Some(serde_json::from_str(&body)?)),
                None => Ok(None),
            }
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ScanMode, ScanStatus};
    use chrono::Utc;
    use sigscan_common::db::init_memory_database;

    fn report(status: ScanStatus, completed: usize) -> ScanReport {
        ScanReport {
            scan_id: Uuid::nil(),
            mode: ScanMode::Quick,
            status,
            requested: 4,
            completed,
            completion_ratio: completed as f64 / 4.0,
            results: Vec::new(),
            no_data: Vec::new(),
            cancelled: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_then_update() {
        let pool = init_memory_database().await.unwrap();
        save_scan(&pool, &report(ScanStatus::Running, 0)).await.unwrap();
        save_scan(&pool, &report(ScanStatus::DeadlineExceeded, 3)).await.unwrap();

        let loaded = load_scan(&pool, Uuid::nil()).await.unwrap().unwrap();
        assert_eq!(loaded.status, ScanStatus::DeadlineExceeded);
        assert_eq!(loaded.completed, 3);
        assert!(load_scan(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }
}
