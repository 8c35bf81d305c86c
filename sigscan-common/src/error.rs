//! Errors shared by the scanner crates
//!
//! Everything here is an infrastructure failure: the store, the filesystem
//! or the configuration. Scan-level failures (rate limits, open circuits,
//! learner conflicts) live in the engine's `ScanError`, which wraps this type
//! as its persistence case.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// SQLite query or connection failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Creating the database directory or reading a config or universe file
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unreadable or invalid config, or an invalid universe file. Fatal at
    /// startup; a failed universe reload keeps the current records.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON column (contributions, weight maps, learner state) failed to
    /// encode or decode
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row decoded but makes no sense: bad timestamp, unknown tier
    /// or label, a learner state pointing at a missing weight version
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}
