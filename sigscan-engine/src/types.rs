//! Core domain types
//!
//! Identifiers, signals, weight vectors, conviction results, outcomes and the
//! error taxonomy shared by every stage of the scan pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Tradable identifier; its ordering is the tie-break order of scan output
    Identifier
);
string_id!(
    /// Category of upstream data (insider, options, sentiment, ...)
    DataClass
);
string_id!(
    /// Upstream provider id
    SourceId
);

/// Name of a scored signal
pub type SignalName = String;

/// One provider reading for one signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    /// Nominally in [0, 100]; validated before scoring
    pub score: f64,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Warnings the provider attached
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Numeric context used by warning rules (e.g. `volume_ratio`)
    #[serde(default)]
    pub attributes: BTreeMap<String, f64>,
}

fn default_confidence() -> f64 {
    1.0
}

impl SignalReading {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            confidence: 1.0,
            warnings: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: f64) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn with_warning(mut self, warning: &str) -> Self {
        self.warnings.push(warning.to_string());
        self
    }
}

/// A signal that is either present or explicitly missing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SignalSlot {
    Present(SignalReading),
    Absent { reason: String },
}

/// Per-identifier signals gathered by one scan. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalVector {
    pub identifier: Identifier,
    pub as_of: DateTime<Utc>,
    pub signals: BTreeMap<SignalName, SignalSlot>,
}

impl SignalVector {
    pub fn new(identifier: Identifier, as_of: DateTime<Utc>) -> Self {
        Self {
            identifier,
            as_of,
            signals: BTreeMap::new(),
        }
    }

    pub fn present(mut self, signal: &str, reading: SignalReading) -> Self {
        self.signals.insert(signal.to_string(), SignalSlot::Present(reading));
        self
    }

    pub fn absent(mut self, signal: &str, reason: impl Into<String>) -> Self {
        self.signals.insert(
            signal.to_string(),
            SignalSlot::Absent {
                reason: reason.into(),
            },
        );
        self
    }

    pub fn present_count(&self) -> usize {
        self.signals
            .values()
            .filter(|slot| matches!(slot, SignalSlot::Present(_)))
            .count()
    }
}

/// Sum tolerance accepted for a stored weight vector
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WeightError {
    #[error("weight vector is empty")]
    Empty,

    #[error("weight for '{0}' is negative")]
    Negative(SignalName),

    #[error("weight for '{0}' is not a finite number")]
    NonFinite(SignalName),

    #[error("weights sum to zero and cannot be normalized")]
    ZeroSum,
}

/// Non-negative signal weights summing to 1, with a monotonic version.
///
/// Fields are private: the only ways to obtain one are [`WeightVector::normalized`]
/// and deserialization, which runs the same validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WeightVectorRecord", into = "WeightVectorRecord")]
pub struct WeightVector {
    version: u64,
    effective_from: DateTime<Utc>,
    weights: BTreeMap<SignalName, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WeightVectorRecord {
    version: u64,
    effective_from: DateTime<Utc>,
    weights: BTreeMap<SignalName, f64>,
}

impl WeightVector {
    /// Validate raw weights and scale them to sum to 1
    pub fn normalized(
        version: u64,
        effective_from: DateTime<Utc>,
        raw: BTreeMap<SignalName, f64>,
    ) -> Result<Self, WeightError> {
        if raw.is_empty() {
            return Err(WeightError::Empty);
        }

        let mut total = 0.0;
        for (name, weight) in &raw {
            if !weight.is_finite() {
                return Err(WeightError::NonFinite(name.clone()));
            }
            if *weight < 0.0 {
                return Err(WeightError::Negative(name.clone()));
            }
            total += weight;
        }
        if total <= 0.0 {
            return Err(WeightError::ZeroSum);
        }

        let weights = raw.into_iter().map(|(k, w)| (k, w / total)).collect();
        Ok(Self {
            version,
            effective_from,
            weights,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn effective_from(&self) -> DateTime<Utc> {
        self.effective_from
    }

    pub fn weights(&self) -> &BTreeMap<SignalName, f64> {
        &self.weights
    }

    /// Weight of a signal; zero when the vector does not name it
    pub fn weight(&self, signal: &str) -> f64 {
        self.weights.get(signal).copied().unwrap_or(0.0)
    }

    /// Same weights under a new version and timestamp
    pub fn reissue(&self, version: u64, effective_from: DateTime<Utc>) -> Self {
        Self {
            version,
            effective_from,
            weights: self.weights.clone(),
        }
    }
}

impl TryFrom<WeightVectorRecord> for WeightVector {
    type Error = WeightError;

    fn try_from(record: WeightVectorRecord) -> Result<Self, Self::Error> {
        WeightVector::normalized(record.version, record.effective_from, record.weights)
    }
}

impl From<WeightVector> for WeightVectorRecord {
    fn from(vector: WeightVector) -> Self {
        Self {
            version: vector.version,
            effective_from: vector.effective_from,
            weights: vector.weights,
        }
    }
}

/// Recommendation tiers, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Avoid,
    Neutral,
    Watch,
    Buy,
    StrongBuy,
}

impl Recommendation {
    /// One level down, saturating at Avoid
    pub fn downgrade(self) -> Self {
        match self {
            Recommendation::StrongBuy => Recommendation::Buy,
            Recommendation::Buy => Recommendation::Watch,
            Recommendation::Watch => Recommendation::Neutral,
            Recommendation::Neutral | Recommendation::Avoid => Recommendation::Avoid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Avoid => "avoid",
            Recommendation::Neutral => "neutral",
            Recommendation::Watch => "watch",
            Recommendation::Buy => "buy",
            Recommendation::StrongBuy => "strong_buy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "avoid" => Some(Recommendation::Avoid),
            "neutral" => Some(Recommendation::Neutral),
            "watch" => Some(Recommendation::Watch),
            "buy" => Some(Recommendation::Buy),
            "strong_buy" => Some(Recommendation::StrongBuy),
            _ => None,
        }
    }
}

/// How one present signal fed the raw score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub signal: SignalName,
    /// Score after clamping to [0, 100]
    pub score: f64,
    /// Weight as stored in the vector
    pub weight: f64,
    /// Weight renormalized over the present signals
    pub effective_weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsentSignal {
    pub signal: SignalName,
    pub reason: String,
}

/// Scored identifier. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvictionResult {
    pub identifier: Identifier,
    pub raw_score: f64,
    pub contributions: Vec<SignalContribution>,
    /// Signals excluded from scoring and why
    pub absent: Vec<AbsentSignal>,
    /// Every warning attached to the result (rule kinds, provider flags, exclusions)
    pub warnings: Vec<String>,
    /// Warning kinds that each cost one tier
    pub downgrades: Vec<String>,
    pub bullish: usize,
    pub bearish: usize,
    /// Tier before warning downgrades
    pub base_tier: Recommendation,
    pub tier: Recommendation,
    pub weight_version: u64,
    pub generated_at: DateTime<Utc>,
}

/// Identifier with no usable signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoDataReport {
    pub identifier: Identifier,
    pub reasons: Vec<AbsentSignal>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScoreOutcome {
    Conviction(ConvictionResult),
    NoData(NoDataReport),
}

impl ScoreOutcome {
    pub fn conviction(&self) -> Option<&ConvictionResult> {
        match self {
            ScoreOutcome::Conviction(result) => Some(result),
            ScoreOutcome::NoData(_) => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, ScoreOutcome::NoData(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    /// Every configured data class
    #[default]
    Full,
    /// Only classes flagged `quick`
    Quick,
}

impl ScanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanMode::Full => "full",
            ScanMode::Quick => "quick",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    /// Deadline hit; results are partial
    DeadlineExceeded,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// Everything `get_results` hands back for one scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub scan_id: Uuid,
    pub mode: ScanMode,
    pub status: ScanStatus,
    pub requested: usize,
    /// Pipelines that finished (scored or no-data)
    pub completed: usize,
    pub completion_ratio: f64,
    /// Sorted by raw score descending, then identifier ascending
    pub results: Vec<ConvictionResult>,
    pub no_data: Vec<NoDataReport>,
    /// Pipelines cut off by the deadline
    pub cancelled: Vec<Identifier>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeLabel {
    Win,
    Flat,
    Loss,
}

impl OutcomeLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeLabel::Win => "win",
            OutcomeLabel::Flat => "flat",
            OutcomeLabel::Loss => "loss",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "win" => Some(OutcomeLabel::Win),
            "flat" => Some(OutcomeLabel::Flat),
            "loss" => Some(OutcomeLabel::Loss),
            _ => None,
        }
    }
}

/// Realized result of one visible conviction at one horizon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub identifier: Identifier,
    pub scan_id: Uuid,
    pub weight_version: u64,
    #[serde(with = "sigscan_common::human_time::serde_duration")]
    pub horizon: Duration,
    pub realized_return: f64,
    pub label: OutcomeLabel,
    pub recorded_at: DateTime<Utc>,
}

/// Scan pipeline error taxonomy
#[derive(Debug, Error)]
pub enum ScanError {
    /// Network or provider hiccup; retried with backoff
    #[error("transient fetch error from {source_id}: {message}")]
    TransientFetch { source_id: SourceId, message: String },

    /// No token within the allowed wait
    #[error("rate limit exceeded for {source_id} (next token in {wait_ms}ms)")]
    RateLimitExceeded { source_id: SourceId, wait_ms: u64 },

    /// Source (or whole fallback chain) cannot serve the data class
    #[error("upstream unavailable for {data_class}: {message}")]
    UpstreamUnavailable { data_class: DataClass, message: String },

    #[error("data validation failed: {0}")]
    DataValidation(String),

    /// Candidate regressed against its baseline; forces rollback
    #[error("learner regression on v{candidate} vs v{baseline}: mean diff {mean_diff:.4}, p={p_value:.4}")]
    LearnerRegression {
        candidate: u64,
        baseline: u64,
        mean_diff: f64,
        p_value: f64,
    },

    #[error("horizon for {identifier} has not elapsed ({remaining_secs}s remaining)")]
    HorizonNotElapsed {
        identifier: Identifier,
        remaining_secs: i64,
    },

    #[error("unknown scan {0}")]
    UnknownScan(Uuid),

    #[error("no visible result for {identifier} in scan {scan_id}")]
    UnknownEmission { scan_id: Uuid, identifier: Identifier },

    #[error("outcome already recorded for {identifier} in scan {scan_id} at that horizon")]
    DuplicateOutcome { scan_id: Uuid, identifier: Identifier },

    #[error("learner busy: {0}")]
    LearnerBusy(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Weights(#[from] WeightError),

    #[error("persistence error: {0}")]
    Persistence(#[from] sigscan_common::Error),
}

impl From<sqlx::Error> for ScanError {
    fn from(err: sqlx::Error) -> Self {
        ScanError::Persistence(sigscan_common::Error::Database(err))
    }
}

impl From<serde_json::Error> for ScanError {
    fn from(err: serde_json::Error) -> Self {
        ScanError::Persistence(sigscan_common::Error::Serialization(err))
    }
}

impl ScanError {
    /// Worth another attempt against the same source
    pub fn is_transient(&self) -> bool {
        matches!(self, ScanError::TransientFetch { .. })
    }
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
