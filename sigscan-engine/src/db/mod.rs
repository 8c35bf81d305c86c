//! Engine persistence
//!
//! Runtime-checked sqlx queries against the schema created by
//! `sigscan_common::db`. Records are stored as JSON text with their version
//! or timestamp in dedicated columns so they can be ordered and filtered.

pub mod cache;
pub mod learner;
pub mod outcomes;
pub mod scans;
pub mod weights;

use chrono::{DateTime, SecondsFormat, Utc};
use sigscan_common::{Error, Result};

/// Fixed-width RFC 3339 so stored timestamps compare as text
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp column
pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::CorruptRecord(format!("Invalid {} timestamp '{}': {}", column, value, e)))
}
