//! Adaptive weight learner
//!
//! **Lifecycle of a candidate:**
//! ```text
//! active → candidate_proposed → shadow_evaluating ─┬→ rejected → active
//!                                                  └→ staged 10 → 25 → 50 → 100 → active
//!                                                          └→ rolled_back (frozen)
//! ```
//!
//! Readers load one [`Published`] snapshot through `ArcSwap` and never see a
//! partially updated vector. All transitions go through the `core` mutex, so
//! there is exactly one writer at a time.

pub mod gate;
pub mod posterior;
pub mod routing;

pub use gate::GateStatistics;
pub use posterior::{BetaPosterior, Posteriors};

use crate::outcomes::{Emission, OutcomeTracker};
use crate::types::{Identifier, OutcomeLabel, OutcomeRecord, ScanError, ScanResult, SignalName, WeightVector};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use sigscan_common::config::{LearnerConfig, SigscanConfig};
use sigscan_common::events::{EventBus, ScanEvent};
use sigscan_common::time::SharedClock;
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum RolloutStage {
    Active,
    CandidateProposed,
    ShadowEvaluating,
    /// Candidate visible to `rollout_stages[step]` percent of identifiers
    Staged { step: usize },
    /// Last-known-good restored; promotion frozen until resumed
    RolledBack,
}

impl RolloutStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStage::Active => "active",
            RolloutStage::CandidateProposed => "candidate_proposed",
            RolloutStage::ShadowEvaluating => "shadow_evaluating",
            RolloutStage::Staged { .. } => "staged",
            RolloutStage::RolledBack => "rolled_back",
        }
    }
}

/// The snapshot every reader sees
#[derive(Debug, Clone)]
pub struct Published {
    pub active: Arc<WeightVector>,
    pub candidate: Option<Arc<WeightVector>>,
    pub stage: RolloutStage,
    pub rollout_percent: u8,
    pub frozen: bool,
    /// Version of the last fully promoted vector
    pub last_known_good: u64,
    pub published_at: DateTime<Utc>,
}

/// Which vector an identifier sees, and which one is scored in shadow
#[derive(Debug, Clone)]
pub struct Routing {
    pub visible: Arc<WeightVector>,
    pub shadow: Option<Arc<WeightVector>>,
}

impl Published {
    pub fn routing(&self, identifier: &Identifier) -> Routing {
        match &self.candidate {
            Some(candidate) => {
                let staged = matches!(self.stage, RolloutStage::Staged { .. });
                if staged && routing::in_rollout(identifier, self.rollout_percent) {
                    Routing {
                        visible: candidate.clone(),
                        shadow: Some(self.active.clone()),
                    }
                } else {
                    Routing {
                        visible: self.active.clone(),
                        shadow: Some(candidate.clone()),
                    }
                }
            }
            None => Routing {
                visible: self.active.clone(),
                shadow: None,
            },
        }
    }
}

/// Result of one `evaluate` call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// No candidate under evaluation
    Idle,
    Pending {
        stage: RolloutStage,
        samples: usize,
        required: usize,
    },
    Rejected {
        candidate: u64,
        stats: GateStatistics,
    },
    Advanced {
        candidate: u64,
        rollout_percent: u8,
        stats: GateStatistics,
    },
    Promoted {
        version: u64,
        stats: GateStatistics,
    },
}

/// Read-only view for the API
#[derive(Debug, Clone, Serialize)]
pub struct LearnerStatus {
    pub active_version: u64,
    pub candidate_version: Option<u64>,
    pub stage: RolloutStage,
    pub rollout_percent: u8,
    pub frozen: bool,
    pub last_known_good: u64,
    pub published_at: DateTime<Utc>,
    pub stage_started_at: DateTime<Utc>,
    pub posterior_means: BTreeMap<SignalName, f64>,
}

/// Persisted form of the learner state
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LearnerRecord {
    active_version: u64,
    candidate_version: Option<u64>,
    stage: RolloutStage,
    rollout_percent: u8,
    frozen: bool,
    last_known_good: u64,
    next_version: u64,
    stage_started_at: DateTime<Utc>,
    posteriors: Posteriors,
}

struct LearnerCore {
    posteriors: Posteriors,
    next_version: u64,
    stage_started_at: DateTime<Utc>,
    rng: StdRng,
    /// Posteriors changed since the last persisted record
    dirty: bool,
}

pub struct WeightLearner {
    published: ArcSwap<Published>,
    core: Mutex<LearnerCore>,
    registry: DashMap<u64, Arc<WeightVector>>,
    config: LearnerConfig,
    learning_horizon: Duration,
    tracker: Arc<OutcomeTracker>,
    pool: Option<SqlitePool>,
    clock: SharedClock,
    events: EventBus,
}

impl WeightLearner {
    /// Restore the newest persisted state, or start from the configured
    /// initial weights. Any failure here is a startup error.
    pub async fn bootstrap(
        config: &SigscanConfig,
        tracker: Arc<OutcomeTracker>,
        pool: Option<SqlitePool>,
        clock: SharedClock,
        events: EventBus,
    ) -> ScanResult<Self> {
        let registry = DashMap::new();
        let mut restored: Option<LearnerRecord> = None;

        if let Some(pool) = &pool {
            for vector in crate::db::weights::load_versions(pool).await? {
                registry.insert(vector.version(), Arc::new(vector));
            }
            if let Some((record, _)) = crate::db::learner::load_latest::<LearnerRecord>(pool).await? {
                restored = Some(record);
            }
        }

        let now = clock.now();
        let (published, core, fresh) = match restored {
            Some(record) => {
                let resolve = |version: u64| {
                    registry.get(&version).map(|v| v.value().clone()).ok_or_else(|| {
                        ScanError::Persistence(sigscan_common::Error::CorruptRecord(format!(
                            "learner state references missing weight version {}",
                            version
                        )))
                    })
                };
                let active = resolve(record.active_version)?;
                let candidate = record.candidate_version.map(resolve).transpose()?;
                info!(
                    active = record.active_version,
                    candidate = ?record.candidate_version,
                    stage = record.stage.as_str(),
                    frozen = record.frozen,
                    "Restored learner state"
                );
                (
                    Published {
                        active,
                        candidate,
                        stage: record.stage,
                        rollout_percent: record.rollout_percent,
                        frozen: record.frozen,
                        last_known_good: record.last_known_good,
                        published_at: now,
                    },
                    LearnerCore {
                        posteriors: record.posteriors,
                        next_version: record.next_version,
                        stage_started_at: record.stage_started_at,
                        rng: StdRng::from_entropy(),
                        dirty: false,
                    },
                    false,
                )
            }
            None => {
                let newest = registry.iter().map(|v| *v.key()).max();
                let active = match newest.and_then(|v| registry.get(&v).map(|e| e.value().clone())) {
                    Some(vector) => vector,
                    None => {
                        let vector = Arc::new(WeightVector::normalized(1, now, config.learner.initial_weights.clone())?);
                        if let Some(pool) = &pool {
                            crate::db::weights::insert_version(pool, &vector, "bootstrap").await?;
                        }
                        registry.insert(vector.version(), vector.clone());
                        vector
                    }
                };
                info!(version = active.version(), "Learner bootstrapped");
                let posteriors = Posteriors::from_prior(&config.learner, active.weights().keys());
                let next_version = active.version() + 1;
                (
                    Published {
                        last_known_good: active.version(),
                        active,
                        candidate: None,
                        stage: RolloutStage::Active,
                        rollout_percent: 0,
                        frozen: false,
                        published_at: now,
                    },
                    LearnerCore {
                        posteriors,
                        next_version,
                        stage_started_at: now,
                        rng: StdRng::from_entropy(),
                        dirty: false,
                    },
                    true,
                )
            }
        };

        let learner = Self {
            published: ArcSwap::from_pointee(published),
            core: Mutex::new(core),
            registry,
            config: config.learner.clone(),
            learning_horizon: config.outcomes.learning_horizon,
            tracker,
            pool,
            clock,
            events,
        };

        if fresh {
            let mut core = learner.core.lock().await;
            let snapshot = learner.snapshot();
            learner.persist(&mut core, &snapshot).await?;
        }
        Ok(learner)
    }

    /// Deterministic sampling, for tests and replays
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.core.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Current published snapshot
    pub fn snapshot(&self) -> Arc<Published> {
        self.published.load_full()
    }

    /// Any version ever published
    pub fn resolve(&self, version: u64) -> Option<Arc<WeightVector>> {
        self.registry.get(&version).map(|v| v.value().clone())
    }

    pub fn versions(&self) -> Vec<u64> {
        let mut versions: Vec<u64> = self.registry.iter().map(|v| *v.key()).collect();
        versions.sort_unstable();
        versions
    }

    pub async fn status(&self) -> LearnerStatus {
        let core = self.core.lock().await;
        let published = self.snapshot();
        LearnerStatus {
            active_version: published.active.version(),
            candidate_version: published.candidate.as_ref().map(|c| c.version()),
            stage: published.stage,
            rollout_percent: published.rollout_percent,
            frozen: published.frozen,
            last_known_good: published.last_known_good,
            published_at: published.published_at,
            stage_started_at: core.stage_started_at,
            posterior_means: core.posteriors.means(),
        }
    }

    /// Feed one realized outcome of a visible result into the posteriors
    ///
    /// Only learning-horizon wins and losses count. A signal agrees with the
    /// outcome when its score sits on the same side of 50 as the return;
    /// evidence is weighted by the signal's effective weight.
    pub async fn observe(&self, emission: &Emission, outcome: &OutcomeRecord) {
        if outcome.horizon != self.learning_horizon || outcome.label == OutcomeLabel::Flat {
            return;
        }

        let mut core = self.core.lock().await;
        let went_up = outcome.realized_return > 0.0;
        for contribution in &emission.contributions {
            if contribution.score == 50.0 {
                continue;
            }
            let agreed = (contribution.score > 50.0) == went_up;
            core.posteriors.observe(
                &contribution.signal,
                agreed,
                contribution.effective_weight,
                self.config.posterior_decay,
            );
        }
        core.dirty = true;
    }

    /// Sample a candidate from the posteriors and start shadow evaluation
    pub async fn propose(&self) -> ScanResult<Arc<WeightVector>> {
        let mut core = self.core.lock().await;
        let current = self.snapshot();

        if current.frozen {
            return Err(ScanError::LearnerBusy(
                "promotion is frozen after a rollback; resume first".to_string(),
            ));
        }
        if let Some(candidate) = &current.candidate {
            return Err(ScanError::LearnerBusy(format!(
                "candidate v{} is still under evaluation",
                candidate.version()
            )));
        }

        let now = self.clock.now();
        let version = core.next_version;
        let candidate = {
            let LearnerCore { posteriors, rng, .. } = &mut *core;
            Arc::new(posteriors.propose(&current.active, &self.config, version, now, rng)?)
        };
        core.next_version += 1;

        if let Some(pool) = &self.pool {
            crate::db::weights::insert_version(pool, &candidate, "candidate").await?;
        }
        self.registry.insert(version, candidate.clone());

        let proposed = Published {
            candidate: Some(candidate.clone()),
            stage: RolloutStage::CandidateProposed,
            rollout_percent: 0,
            published_at: now,
            ..(*current).clone()
        };
        self.commit(&mut core, proposed, true).await?;

        let shadowing = Published {
            stage: RolloutStage::ShadowEvaluating,
            ..(*self.snapshot()).clone()
        };
        core.stage_started_at = now;
        self.commit(&mut core, shadowing, true).await?;

        info!(
            candidate = version,
            baseline = current.active.version(),
            "Candidate proposed, shadow evaluation started"
        );
        Ok(candidate)
    }

    /// Judge the current gate against outcomes collected since it opened
    ///
    /// A staged candidate that regresses is rolled back and the regression
    /// is returned as `LearnerRegression`.
    pub async fn evaluate(&self) -> ScanResult<GateDecision> {
        let mut core = self.core.lock().await;
        let current = self.snapshot();

        let Some(candidate) = current.candidate.clone() else {
            if core.dirty {
                self.persist(&mut core, &current).await?;
            }
            return Ok(GateDecision::Idle);
        };

        let required = match current.stage {
            RolloutStage::Staged { .. } => self.config.min_stage_samples,
            _ => self.config.min_shadow_samples,
        };
        let samples = self.tracker.paired_samples(
            candidate.version(),
            current.active.version(),
            self.learning_horizon,
            core.stage_started_at,
        );
        let stats = match GateStatistics::from_samples(&samples) {
            Some(stats) if samples.len() >= required => stats,
            _ => {
                if core.dirty {
                    self.persist(&mut core, &current).await?;
                }
                return Ok(GateDecision::Pending {
                    stage: current.stage,
                    samples: samples.len(),
                    required,
                });
            }
        };

        let regressed = stats.significant_regression(self.config.significance)
            || stats.beyond_threshold(self.config.rollback_threshold);
        let now = self.clock.now();

        match current.stage {
            RolloutStage::Staged { step } => {
                if regressed {
                    return Err(self.rollback(&mut core, &current, &candidate, stats).await);
                }

                let next_step = step + 1;
                if let Some(&percent) = self.config.rollout_stages.get(next_step) {
                    core.stage_started_at = now;
                    let next = Published {
                        stage: RolloutStage::Staged { step: next_step },
                        rollout_percent: percent,
                        published_at: now,
                        ..(*current).clone()
                    };
                    self.commit(&mut core, next, true).await?;
                    info!(candidate = candidate.version(), rollout_percent = percent, "Rollout advanced");
                    return Ok(GateDecision::Advanced {
                        candidate: candidate.version(),
                        rollout_percent: percent,
                        stats,
                    });
                }

                core.stage_started_at = now;
                let promoted = Published {
                    active: candidate.clone(),
                    candidate: None,
                    stage: RolloutStage::Active,
                    rollout_percent: 0,
                    frozen: false,
                    last_known_good: candidate.version(),
                    published_at: now,
                };
                self.commit(&mut core, promoted, true).await?;
                info!(version = candidate.version(), "Candidate fully promoted");
                Ok(GateDecision::Promoted {
                    version: candidate.version(),
                    stats,
                })
            }
            _ if regressed => {
                core.stage_started_at = now;
                let rejected = Published {
                    candidate: None,
                    stage: RolloutStage::Active,
                    rollout_percent: 0,
                    published_at: now,
                    ..(*current).clone()
                };
                self.commit(&mut core, rejected, true).await?;
                let reason = format!(
                    "shadow regression: mean diff {:.4}, p={:.4} over {} samples",
                    stats.mean_diff, stats.p_value, stats.samples
                );
                warn!(candidate = candidate.version(), %reason, "Candidate rejected");
                self.events.emit_lossy(ScanEvent::CandidateRejected {
                    candidate_version: candidate.version(),
                    reason,
                    timestamp: now,
                });
                Ok(GateDecision::Rejected {
                    candidate: candidate.version(),
                    stats,
                })
            }
            _ => {
                let percent = self.config.rollout_stages.first().copied().unwrap_or(100);
                core.stage_started_at = now;
                let staged = Published {
                    stage: RolloutStage::Staged { step: 0 },
                    rollout_percent: percent,
                    published_at: now,
                    ..(*current).clone()
                };
                self.commit(&mut core, staged, true).await?;
                info!(candidate = candidate.version(), rollout_percent = percent, "Candidate passed shadow gate");
                Ok(GateDecision::Advanced {
                    candidate: candidate.version(),
                    rollout_percent: percent,
                    stats,
                })
            }
        }
    }

    /// Clear a rollback freeze. Returns false when nothing was frozen.
    pub async fn resume(&self) -> ScanResult<bool> {
        let mut core = self.core.lock().await;
        let current = self.snapshot();
        if !current.frozen {
            return Ok(false);
        }

        let now = self.clock.now();
        core.stage_started_at = now;
        let resumed = Published {
            stage: RolloutStage::Active,
            frozen: false,
            published_at: now,
            ..(*current).clone()
        };
        self.commit(&mut core, resumed, true).await?;
        info!(active = current.active.version(), "Learner resumed");
        Ok(true)
    }

    /// Restore last-known-good in a single swap and freeze promotion
    async fn rollback(
        &self,
        core: &mut LearnerCore,
        current: &Published,
        candidate: &WeightVector,
        stats: GateStatistics,
    ) -> ScanError {
        let now = self.clock.now();
        let restored = self
            .resolve(current.last_known_good)
            .unwrap_or_else(|| current.active.clone());
        let restored_version = restored.version();

        core.stage_started_at = now;
        let rolled_back = Published {
            active: restored,
            candidate: None,
            stage: RolloutStage::RolledBack,
            rollout_percent: 0,
            frozen: true,
            last_known_good: restored_version,
            published_at: now,
        };
        // The swap must happen even if the record cannot be written
        if let Err(e) = self.commit(core, rolled_back, false).await {
            error!(error = %e, "Rollback record not persisted");
        }

        let reason = format!(
            "regression at {}% rollout: mean diff {:.4}, p={:.4}",
            current.rollout_percent, stats.mean_diff, stats.p_value
        );
        warn!(
            candidate = candidate.version(),
            restored = restored_version,
            %reason,
            "Rolled back to last-known-good weights"
        );
        self.events.emit_lossy(ScanEvent::LearnerRolledBack {
            from_version: candidate.version(),
            restored_version,
            reason,
            timestamp: now,
        });

        ScanError::LearnerRegression {
            candidate: candidate.version(),
            baseline: restored_version,
            mean_diff: stats.mean_diff,
            p_value: stats.p_value,
        }
    }

    /// Persist then publish. With `required`, a failed write aborts before
    /// readers see the new snapshot.
    async fn commit(&self, core: &mut LearnerCore, next: Published, required: bool) -> ScanResult<()> {
        match self.persist(core, &next).await {
            Ok(()) => {}
            Err(e) if required => return Err(e),
            Err(e) => error!(error = %e, "Learner state not persisted"),
        }

        self.events.emit_lossy(ScanEvent::WeightsPublished {
            active_version: next.active.version(),
            candidate_version: next.candidate.as_ref().map(|c| c.version()),
            stage: next.stage.as_str().to_string(),
            rollout_percent: next.rollout_percent,
            timestamp: next.published_at,
        });
        self.published.store(Arc::new(next));
        Ok(())
    }

    async fn persist(&self, core: &mut LearnerCore, published: &Published) -> ScanResult<()> {
        let Some(pool) = &self.pool else {
            core.dirty = false;
            return Ok(());
        };

        let record = LearnerRecord {
            active_version: published.active.version(),
            candidate_version: published.candidate.as_ref().map(|c| c.version()),
            stage: published.stage,
            rollout_percent: published.rollout_percent,
            frozen: published.frozen,
            last_known_good: published.last_known_good,
            next_version: core.next_version,
            stage_started_at: core.stage_started_at,
            posteriors: core.posteriors.clone(),
        };
        crate::db::learner::append_state(pool, published.stage.as_str(), &record, self.clock.now()).await?;
        core.dirty = false;
        Ok(())
    }
}
