//! Configuration loading and validation
//!
//! The whole tunable surface lives in one TOML document parsed into
//! [`SigscanConfig`]. Config file resolution follows this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`SIGSCAN_CONFIG`)
//! 3. Platform config file (`<config_dir>/sigscan/config.toml`)
//! 4. Compiled defaults (fallback)
//!
//! Validation errors are `Error::Config` and are fatal at startup.

use crate::human_time::{serde_duration, serde_duration_vec};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "SIGSCAN_CONFIG";

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SigscanConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub scan: ScanConfig,
    pub cache: CacheConfig,
    /// Upstream sources keyed by source id
    pub sources: BTreeMap<String, SourceConfig>,
    /// Data classes keyed by class id
    pub data_classes: BTreeMap<String, DataClassConfig>,
    pub scoring: ScoringConfig,
    pub learner: LearnerConfig,
    pub outcomes: OutcomeConfig,
    /// Identifiers loaded into the universe at startup
    pub universe: Vec<UniverseEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub bind: String,
    /// SQLite file; defaults to the platform data directory
    pub database_path: Option<PathBuf>,
    pub event_capacity: usize,
    /// Period of the background propose/evaluate loop
    #[serde(with = "serde_duration")]
    pub learning_interval: Duration,
    /// Finished scan reports kept in memory for `get_results`
    pub result_retention: usize,
    /// TOML file of `[[universe]]` entries merged into the inline universe
    /// and re-read every `universe_refresh`
    pub universe_file: Option<PathBuf>,
    #[serde(with = "serde_duration")]
    pub universe_refresh: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5790".to_string(),
            database_path: None,
            event_capacity: 256,
            learning_interval: Duration::from_secs(3_600),
            result_retention: 64,
            universe_file: None,
            universe_refresh: Duration::from_secs(6 * 3_600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` overrides it
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Global cap on concurrently running identifier pipelines
    pub concurrency: usize,
    #[serde(with = "serde_duration")]
    pub deadline: Duration,
    /// Per upstream attempt; independent of the scan deadline
    #[serde(with = "serde_duration")]
    pub fetch_timeout: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            deadline: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Entry capacity of the recency tier (LRU beyond this)
    pub recency_capacity: u64,
    #[serde(with = "serde_duration")]
    pub prefetch_interval: Duration,
    /// Fraction of TTL after which a hot entry is refreshed ahead of expiry
    pub prefetch_at: f64,
    /// A key is hot if it was requested within this window
    #[serde(with = "serde_duration")]
    pub hot_window: Duration,
    pub prefetch_batch: usize,
    #[serde(with = "serde_duration")]
    pub compaction_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            recency_capacity: 10_000,
            prefetch_interval: Duration::from_secs(30),
            prefetch_at: 0.8,
            hot_window: Duration::from_secs(900),
            prefetch_batch: 64,
            compaction_interval: Duration::from_secs(600),
        }
    }
}

/// Token bucket, retry and breaker settings for one upstream source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Base URL for the HTTP adapter
    pub endpoint: Option<String>,
    /// Bucket capacity (burst size)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Longest a caller waits for a token before `RateLimitExceeded`
    #[serde(with = "serde_duration")]
    pub max_wait: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    #[serde(with = "serde_duration")]
    pub backoff_initial: Duration,
    #[serde(with = "serde_duration")]
    pub backoff_max: Duration,
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    #[serde(with = "serde_duration")]
    pub cooldown: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            capacity: 10,
            refill_per_sec: 5.0,
            max_wait: Duration::from_secs(2),
            max_retries: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Which cache tier holds a data class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    #[default]
    Recency,
    Durable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataClassConfig {
    /// Primary source id
    pub source: String,
    /// Tried in order when the primary cannot serve
    #[serde(default)]
    pub fallback_sources: Vec<String>,
    #[serde(default)]
    pub tier: CacheTier,
    #[serde(with = "serde_duration")]
    pub ttl: Duration,
    #[serde(with = "serde_duration")]
    pub hard_ceiling: Duration,
    /// Signal name produced by this class; defaults to the class id
    #[serde(default)]
    pub signal: Option<String>,
    /// Included in quick scans
    #[serde(default)]
    pub quick: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierThresholds {
    pub strong_buy: f64,
    pub buy: f64,
    pub watch: f64,
    pub neutral: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            strong_buy: 75.0,
            buy: 60.0,
            watch: 45.0,
            neutral: 30.0,
        }
    }
}

/// One warning rule. Every condition that is set must hold for it to fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WarningRuleConfig {
    /// Warning type; each type downgrades at most once
    pub kind: String,
    pub signal: String,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub attribute_min: Option<f64>,
    /// Fires when the provider attached this warning to the signal
    #[serde(default)]
    pub provider_flag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringConfig {
    pub thresholds: TierThresholds,
    /// A signal strictly above this counts as bullish
    pub bullish_cutoff: f64,
    /// A signal strictly below this counts as bearish
    pub bearish_cutoff: f64,
    pub strong_buy_min_bullish: usize,
    pub buy_min_bullish: usize,
    /// Bearish count that caps the tier at Watch
    pub bearish_veto: usize,
    /// Out-of-range scores within this margin are clamped, beyond it excluded
    pub score_tolerance: f64,
    pub min_confidence: f64,
    pub warnings: Vec<WarningRuleConfig>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            thresholds: TierThresholds::default(),
            bullish_cutoff: 65.0,
            bearish_cutoff: 35.0,
            strong_buy_min_bullish: 3,
            buy_min_bullish: 2,
            bearish_veto: 2,
            score_tolerance: 5.0,
            min_confidence: 0.0,
            warnings: vec![
                WarningRuleConfig {
                    kind: "euphoric_sentiment".to_string(),
                    signal: "sentiment".to_string(),
                    min_score: Some(85.0),
                    attribute: Some("volume_ratio".to_string()),
                    attribute_min: Some(2.0),
                    provider_flag: None,
                },
                WarningRuleConfig {
                    kind: "overextended".to_string(),
                    signal: "technical".to_string(),
                    min_score: None,
                    attribute: Some("extension_pct".to_string()),
                    attribute_min: Some(25.0),
                    provider_flag: None,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearnerConfig {
    /// Bootstrap weight vector; normalized at startup
    pub initial_weights: BTreeMap<String, f64>,
    pub prior_alpha: f64,
    pub prior_beta: f64,
    /// Paired samples needed before the shadow gate is judged
    pub min_shadow_samples: usize,
    /// Paired samples needed before each rollout gate is judged
    pub min_stage_samples: usize,
    /// Visible traffic percentages, strictly increasing, ending at 100
    pub rollout_stages: Vec<u8>,
    /// Mean attributed-metric drop that forces rollback
    pub rollback_threshold: f64,
    /// One-sided p-value below which a regression is significant
    pub significance: f64,
    /// Minimum weight every signal keeps in a candidate
    pub exploration_floor: f64,
    /// Largest fraction a candidate may move away from the active vector
    pub max_step: f64,
    /// Multiplier applied to posterior evidence on each update (1.0 = none)
    pub posterior_decay: f64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        let initial_weights = [
            ("insider", 0.25),
            ("options", 0.25),
            ("patents", 0.12),
            ("contracts", 0.13),
            ("sentiment", 0.10),
            ("technical", 0.15),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            initial_weights,
            prior_alpha: 2.0,
            prior_beta: 2.0,
            min_shadow_samples: 30,
            min_stage_samples: 20,
            rollout_stages: vec![10, 25, 50, 100],
            rollback_threshold: 0.02,
            significance: 0.05,
            exploration_floor: 0.02,
            max_step: 0.25,
            posterior_decay: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutcomeConfig {
    /// Horizons accepted by `record_outcome`
    #[serde(with = "serde_duration_vec")]
    pub horizons: Vec<Duration>,
    /// Horizon whose outcomes feed the learner
    #[serde(with = "serde_duration")]
    pub learning_horizon: Duration,
    /// Returns at or above this are wins
    pub win_threshold: f64,
    /// Returns at or below this are losses
    pub loss_threshold: f64,
    /// How long past the longest horizon emissions are kept for late outcomes
    #[serde(with = "serde_duration")]
    pub retention_grace: Duration,
}

impl Default for OutcomeConfig {
    fn default() -> Self {
        const DAY: u64 = 86_400;
        Self {
            horizons: vec![
                Duration::from_secs(DAY),
                Duration::from_secs(5 * DAY),
                Duration::from_secs(20 * DAY),
            ],
            learning_horizon: Duration::from_secs(5 * DAY),
            win_threshold: 0.02,
            loss_threshold: -0.02,
            retention_grace: Duration::from_secs(7 * DAY),
        }
    }
}

/// Static identifier attributes loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UniverseEntry {
    pub id: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub tier: Option<String>,
}

impl DataClassConfig {
    /// Signal produced by the class `class_id`
    pub fn signal_name<'a>(&'a self, class_id: &'a str) -> &'a str {
        self.signal.as_deref().unwrap_or(class_id)
    }

    /// Primary followed by fallbacks
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.source.as_str()).chain(self.fallback_sources.iter().map(String::as_str))
    }
}

impl SigscanConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SigscanConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Signal names in class order
    pub fn signal_names(&self) -> BTreeSet<String> {
        self.data_classes
            .iter()
            .map(|(id, class)| class.signal_name(id).to_string())
            .collect()
    }

    /// Database path, falling back to the platform data directory
    pub fn database_path(&self) -> PathBuf {
        self.service
            .database_path
            .clone()
            .unwrap_or_else(default_database_path)
    }

    /// Check every cross-reference and numeric range.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));

        if self.scan.concurrency == 0 {
            return fail("scan.concurrency must be at least 1".to_string());
        }
        if self.scan.deadline.is_zero() || self.scan.fetch_timeout.is_zero() {
            return fail("scan.deadline and scan.fetch_timeout must be non-zero".to_string());
        }
        if self.service.universe_refresh.is_zero() {
            return fail("service.universe_refresh must be non-zero".to_string());
        }
        if self.service.event_capacity == 0 || self.service.result_retention == 0 {
            return fail("service.event_capacity and service.result_retention must be non-zero".to_string());
        }
        if self.cache.recency_capacity == 0 {
            return fail("cache.recency_capacity must be non-zero".to_string());
        }
        if !(self.cache.prefetch_at > 0.0 && self.cache.prefetch_at < 1.0) {
            return fail("cache.prefetch_at must be within (0, 1)".to_string());
        }

        for (id, source) in &self.sources {
            if source.capacity == 0 {
                return fail(format!("sources.{}.capacity must be non-zero", id));
            }
            if !(source.refill_per_sec.is_finite() && source.refill_per_sec > 0.0) {
                return fail(format!("sources.{}.refill_per_sec must be positive", id));
            }
            if source.backoff_initial > source.backoff_max {
                return fail(format!("sources.{}.backoff_initial exceeds backoff_max", id));
            }
            if source.failure_threshold == 0 {
                return fail(format!("sources.{}.failure_threshold must be non-zero", id));
            }
        }

        if self.data_classes.is_empty() {
            return fail("at least one data class must be configured".to_string());
        }

        let mut signals = BTreeSet::new();
        for (id, class) in &self.data_classes {
            let mut seen = BTreeSet::new();
            for source in class.chain() {
                if !self.sources.contains_key(source) {
                    return fail(format!("data_classes.{} references unknown source '{}'", id, source));
                }
                if !seen.insert(source) {
                    return fail(format!("data_classes.{} lists source '{}' twice", id, source));
                }
            }
            if class.ttl.is_zero() || class.ttl > class.hard_ceiling {
                return fail(format!("data_classes.{} needs 0 < ttl <= hard_ceiling", id));
            }
            if !signals.insert(class.signal_name(id)) {
                return fail(format!("signal '{}' is produced by more than one data class", class.signal_name(id)));
            }
        }

        self.validate_scoring(&signals)?;
        self.validate_learner(&signals)?;

        if self.outcomes.win_threshold < self.outcomes.loss_threshold {
            return fail("outcomes.win_threshold must not be below loss_threshold".to_string());
        }
        if self.outcomes.horizons.iter().any(Duration::is_zero) {
            return fail("outcomes.horizons must be non-zero".to_string());
        }
        if !self.outcomes.horizons.contains(&self.outcomes.learning_horizon) {
            return fail("outcomes.learning_horizon must be one of outcomes.horizons".to_string());
        }

        Ok(())
    }

    fn validate_scoring(&self, signals: &BTreeSet<&str>) -> Result<()> {
        let s = &self.scoring;
        let t = &s.thresholds;
        let ordered = 0.0 <= t.neutral && t.neutral < t.watch && t.watch < t.buy && t.buy < t.strong_buy && t.strong_buy <= 100.0;
        if !ordered {
            return Err(Error::Config(
                "scoring.thresholds must satisfy 0 <= neutral < watch < buy < strong_buy <= 100".to_string(),
            ));
        }
        if s.bearish_cutoff >= s.bullish_cutoff {
            return Err(Error::Config("scoring.bearish_cutoff must be below bullish_cutoff".to_string()));
        }
        if !(s.score_tolerance.is_finite() && s.score_tolerance >= 0.0) {
            return Err(Error::Config("scoring.score_tolerance must be non-negative".to_string()));
        }
        for rule in &s.warnings {
            if rule.kind.trim().is_empty() {
                return Err(Error::Config("scoring.warnings entries need a kind".to_string()));
            }
            if !signals.contains(rule.signal.as_str()) {
                return Err(Error::Config(format!(
                    "warning '{}' references unknown signal '{}'",
                    rule.kind, rule.signal
                )));
            }
            if rule.attribute.is_some() != rule.attribute_min.is_some() {
                return Err(Error::Config(format!(
                    "warning '{}' needs both attribute and attribute_min",
                    rule.kind
                )));
            }
        }
        Ok(())
    }

    fn validate_learner(&self, signals: &BTreeSet<&str>) -> Result<()> {
        let l = &self.learner;

        let mut total = 0.0;
        for (name, weight) in &l.initial_weights {
            if !signals.contains(name.as_str()) {
                return Err(Error::Config(format!("learner.initial_weights names unknown signal '{}'", name)));
            }
            if !(weight.is_finite() && *weight >= 0.0) {
                return Err(Error::Config(format!("learner.initial_weights.{} must be a non-negative number", name)));
            }
            total += weight;
        }
        if total <= 0.0 {
            return Err(Error::Config("learner.initial_weights cannot be normalized (zero sum)".to_string()));
        }

        let stages = &l.rollout_stages;
        let increasing = stages.windows(2).all(|w| w[0] < w[1]);
        if stages.is_empty() || !increasing || stages[0] == 0 || stages.last() != Some(&100) {
            return Err(Error::Config(
                "learner.rollout_stages must be strictly increasing percentages ending at 100".to_string(),
            ));
        }
        if !(l.prior_alpha > 0.0 && l.prior_beta > 0.0) {
            return Err(Error::Config("learner priors must be positive".to_string()));
        }
        if !(l.significance > 0.0 && l.significance < 1.0) {
            return Err(Error::Config("learner.significance must be within (0, 1)".to_string()));
        }
        if !(l.rollback_threshold.is_finite() && l.rollback_threshold >= 0.0) {
            return Err(Error::Config("learner.rollback_threshold must be non-negative".to_string()));
        }
        let n = signals.len().max(1) as f64;
        if !(l.exploration_floor >= 0.0 && l.exploration_floor * n < 1.0) {
            return Err(Error::Config("learner.exploration_floor leaves no mass to learn".to_string()));
        }
        if !(l.max_step > 0.0 && l.max_step <= 1.0) {
            return Err(Error::Config("learner.max_step must be within (0, 1]".to_string()));
        }
        if !(l.posterior_decay > 0.0 && l.posterior_decay <= 1.0) {
            return Err(Error::Config("learner.posterior_decay must be within (0, 1]".to_string()));
        }
        if l.min_shadow_samples < 2 || l.min_stage_samples < 2 {
            return Err(Error::Config("learner sample minimums must be at least 2".to_string()));
        }
        Ok(())
    }
}

/// Resolve the config file path by priority: CLI, env var, platform file.
///
/// Returns `None` when nothing is found; callers then use compiled defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    default_config_file().filter(|p| p.exists())
}

/// Load configuration following the resolution order, then validate
pub fn load_config(cli_arg: Option<&Path>) -> Result<SigscanConfig> {
    match resolve_config_path(cli_arg, CONFIG_ENV_VAR) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            SigscanConfig::from_file(&path)
        }
        None => {
            warn!("No config file found, using compiled defaults");
            let config = SigscanConfig::with_sample_classes();
            config.validate()?;
            Ok(config)
        }
    }
}

impl SigscanConfig {
    /// Compiled defaults: one source and the six standard signal classes
    pub fn with_sample_classes() -> Self {
        let mut config = SigscanConfig::default();
        config.sources.insert(
            "primary".to_string(),
            SourceConfig {
                endpoint: Some("http://127.0.0.1:5791".to_string()),
                ..SourceConfig::default()
            },
        );

        let hour = 3_600;
        let classes = [
            ("insider", CacheTier::Durable, 6 * hour, 48 * hour, false),
            ("options", CacheTier::Recency, 300, 3_600, true),
            ("patents", CacheTier::Durable, 24 * hour, 14 * 24 * hour, false),
            ("contracts", CacheTier::Durable, 24 * hour, 7 * 24 * hour, false),
            ("sentiment", CacheTier::Recency, 600, 2 * hour, true),
            ("technical", CacheTier::Recency, 300, hour, true),
        ];
        for (name, tier, ttl, ceiling, quick) in classes {
            config.data_classes.insert(
                name.to_string(),
                DataClassConfig {
                    source: "primary".to_string(),
                    fallback_sources: Vec::new(),
                    tier,
                    ttl: Duration::from_secs(ttl),
                    hard_ceiling: Duration::from_secs(ceiling),
                    signal: None,
                    quick,
                },
            );
        }
        config
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UniverseFile {
    #[serde(default)]
    universe: Vec<UniverseEntry>,
}

/// Read the identifier entries of a universe file
pub fn load_universe_file(path: &Path) -> Result<Vec<UniverseEntry>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read universe file {}: {}", path.display(), e))
    })?;
    let file: UniverseFile = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Invalid universe file {}: {}", path.display(), e)))?;
    Ok(file.universe)
}

/// Platform config file location
fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sigscan").join("config.toml"))
}

/// OS-dependent default database path
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("sigscan"))
        .unwrap_or_else(|| PathBuf::from("./sigscan_data"))
        .join("sigscan.db")
}
