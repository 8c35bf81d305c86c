//! Concurrent scan orchestrator
//!
//! **Per scan:**
//! 1. Resolve identifiers (subset or whole universe); unknown ones are no-data
//! 2. Take one learner snapshot; route each identifier to its visible and
//!    shadow weight vectors
//! 3. Run per-identifier pipelines under a semaphore of `scan.concurrency`
//!    permits; each pipeline fetches its data classes concurrently through
//!    the cache and scores them
//! 4. At the deadline, cancel what is still running and keep what finished
//! 5. Sort (score descending, identifier ascending), register emissions,
//!    persist the summary
//!
//! A failed data class never fails its identifier: it becomes an absent
//! signal with the failure as reason.

use crate::cache::{Freshness, SignalCache};
use crate::learner::{Routing, WeightLearner};
use crate::outcomes::{Emission, OutcomeTracker};
use crate::scoring::ScoringEngine;
use crate::types::{
    AbsentSignal, ConvictionResult, DataClass, Identifier, NoDataReport, ScanError, ScanMode, ScanReport,
    ScanResult, ScanStatus, ScoreOutcome, SignalVector,
};
use crate::universe::Universe;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sigscan_common::config::{ScanConfig, SigscanConfig};
use sigscan_common::events::{EventBus, ScanEvent};
use sigscan_common::time::SharedClock;
use sqlx::SqlitePool;
use std::cmp::Ordering;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One data class as scanned: which signal it feeds and whether quick scans use it
#[derive(Debug, Clone)]
struct ClassPlan {
    data_class: DataClass,
    signal: String,
    quick: bool,
}

/// Scored result of one pipeline
struct PipelineOutcome {
    visible: ScoreOutcome,
    shadow: Option<ScoreOutcome>,
}

pub struct ScanOrchestrator {
    cache: SignalCache,
    engine: ScoringEngine,
    learner: Arc<WeightLearner>,
    tracker: Arc<OutcomeTracker>,
    universe: Arc<Universe>,
    plans: Vec<ClassPlan>,
    scan: ScanConfig,
    retention: usize,
    reports: DashMap<Uuid, ScanReport>,
    /// Scan ids in arrival order, for retention
    order: Mutex<VecDeque<Uuid>>,
    pool: Option<SqlitePool>,
    clock: SharedClock,
    events: EventBus,
}

impl ScanOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &SigscanConfig,
        cache: SignalCache,
        learner: Arc<WeightLearner>,
        tracker: Arc<OutcomeTracker>,
        universe: Arc<Universe>,
        pool: Option<SqlitePool>,
        clock: SharedClock,
        events: EventBus,
    ) -> Self {
        let plans = config
            .data_classes
            .iter()
            .map(|(id, class)| ClassPlan {
                data_class: DataClass::new(id.as_str()),
                signal: class.signal_name(id).to_string(),
                quick: class.quick,
            })
            .collect();

        Self {
            cache,
            engine: ScoringEngine::from_config(&config.scoring),
            learner,
            tracker,
            universe,
            plans,
            scan: config.scan.clone(),
            retention: config.service.result_retention,
            reports: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            pool,
            clock,
            events,
        }
    }

    /// Start a scan in the background and return its id right away
    pub fn run_scan(self: &Arc<Self>, mode: ScanMode, subset: Option<Vec<Identifier>>) -> ScanResult<Uuid> {
        if matches!(&subset, Some(ids) if ids.is_empty()) {
            return Err(ScanError::InvalidInput("identifier subset is empty".to_string()));
        }

        let scan_id = Uuid::new_v4();
        let identifiers = self.resolve_identifiers(subset);
        self.track(self.running_report(scan_id, mode, identifiers.len()));

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute_scan(scan_id, mode, identifiers).await;
        });
        Ok(scan_id)
    }

    /// Report for a scan: in memory while retained, otherwise from the database
    pub async fn get_results(&self, scan_id: Uuid) -> ScanResult<ScanReport> {
        if let Some(report) = self.reports.get(&scan_id) {
            return Ok(report.value().clone());
        }
        if let Some(pool) = &self.pool {
            if let Some(report) = crate::db::scans::load_scan(pool, scan_id).await? {
                return Ok(report);
            }
        }
        Err(ScanError::UnknownScan(scan_id))
    }

    /// Run a scan to completion (or deadline) on the current task
    pub async fn execute_scan(&self, scan_id: Uuid, mode: ScanMode, identifiers: Vec<Identifier>) -> ScanReport {
        let started_at = self.clock.now();
        let requested = identifiers.len();
        let running = self.running_report(scan_id, mode, requested);
        self.track(running.clone());
        self.persist(&running).await;

        info!(scan_id = %scan_id, mode = mode.as_str(), requested, "Scan started");
        self.events.emit_lossy(ScanEvent::ScanStarted {
            scan_id,
            mode: mode.as_str().to_string(),
            requested,
            timestamp: started_at,
        });

        let plans: Arc<Vec<ClassPlan>> = Arc::new(
            self.plans
                .iter()
                .filter(|p| mode == ScanMode::Full || p.quick)
                .cloned()
                .collect(),
        );

        let mut no_data = Vec::new();
        let mut known = Vec::with_capacity(requested);
        for id in identifiers {
            if self.universe.contains(&id) {
                known.push(id);
            } else {
                no_data.push(NoDataReport {
                    identifier: id,
                    reasons: vec![AbsentSignal {
                        signal: "*".to_string(),
                        reason: "unknown identifier".to_string(),
                    }],
                    generated_at: started_at,
                });
            }
        }

        let published = self.learner.snapshot();
        let semaphore = Arc::new(Semaphore::new(self.scan.concurrency));
        let cancel = CancellationToken::new();
        let deadline = tokio::time::Instant::now() + self.scan.deadline;
        let mut pipelines = JoinSet::new();

        for id in &known {
            let id = id.clone();
            let routing = published.routing(&id);
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let plans = plans.clone();
            let cache = self.cache.clone();
            let engine = self.engine.clone();
            let universe = self.universe.clone();

            pipelines.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return (id, None),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (id, None),
                    },
                };
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    outcome = run_pipeline(&cache, &engine, &universe, &plans, &id, routing, started_at) => Some(outcome),
                };
                (id, outcome)
            });
        }

        let mut finished: Vec<(Identifier, PipelineOutcome)> = Vec::with_capacity(known.len());
        let mut deadline_hit = false;
        loop {
            match tokio::time::timeout_at(deadline, pipelines.join_next()).await {
                Ok(Some(Ok((id, Some(outcome))))) => finished.push((id, outcome)),
                Ok(Some(Ok((_, None)))) => {}
                Ok(Some(Err(e))) => error!(scan_id = %scan_id, error = %e, "Pipeline task failed"),
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    cancel.cancel();
                    warn!(
                        scan_id = %scan_id,
                        finished = finished.len(),
                        outstanding = pipelines.len(),
                        "Scan deadline reached, cancelling pipelines"
                    );
                    // Cancelled pipelines return promptly; anything that
                    // finished in the meantime is kept
                    while let Some(joined) = pipelines.join_next().await {
                        if let Ok((id, Some(outcome))) = joined {
                            finished.push((id, outcome));
                        }
                    }
                    break;
                }
            }
        }

        let done: BTreeSet<Identifier> = finished.iter().map(|(id, _)| id.clone()).collect();
        let cancelled: Vec<Identifier> = known.into_iter().filter(|id| !done.contains(id)).collect();

        let mut results = Vec::new();
        for (id, outcome) in finished {
            if let Some(shadow) = outcome.shadow.as_ref().and_then(ScoreOutcome::conviction) {
                self.tracker.record_emission(Emission::from_result(scan_id, shadow, false)).await;
            }
            match outcome.visible {
                ScoreOutcome::Conviction(result) => {
                    self.tracker.record_emission(Emission::from_result(scan_id, &result, true)).await;
                    results.push(result);
                }
                ScoreOutcome::NoData(report) => {
                    debug!(scan_id = %scan_id, identifier = %id, "No usable signals");
                    no_data.push(report);
                }
            }
        }
        sort_results(&mut results);
        no_data.sort_by(|a, b| a.identifier.cmp(&b.identifier));

        let completed = results.len() + no_data.len();
        let completion_ratio = if requested == 0 {
            1.0
        } else {
            completed as f64 / requested as f64
        };
        let status = if deadline_hit {
            ScanStatus::DeadlineExceeded
        } else {
            ScanStatus::Completed
        };
        let finished_at = self.clock.now();

        let report = ScanReport {
            scan_id,
            mode,
            status,
            requested,
            completed,
            completion_ratio,
            results,
            no_data,
            cancelled,
            started_at,
            finished_at: Some(finished_at),
        };

        // Persisted first so a finished report is durable once readers see it
        self.persist(&report).await;
        self.track(report.clone());

        info!(
            scan_id = %scan_id,
            status = status.as_str(),
            requested,
            completed,
            completion_ratio,
            "Scan finished"
        );
        self.events.emit_lossy(ScanEvent::ScanCompleted {
            scan_id,
            status: status.as_str().to_string(),
            requested,
            completed,
            completion_ratio,
            timestamp: finished_at,
        });

        report
    }

    /// Subset deduplicated and sorted, or the whole universe
    pub fn resolve_identifiers(&self, subset: Option<Vec<Identifier>>) -> Vec<Identifier> {
        match subset {
            Some(ids) => ids.into_iter().collect::<BTreeSet<_>>().into_iter().collect(),
            None => self.universe.ids(),
        }
    }

    fn running_report(&self, scan_id: Uuid, mode: ScanMode, requested: usize) -> ScanReport {
        ScanReport {
            scan_id,
            mode,
            status: ScanStatus::Running,
            requested,
            completed: 0,
            completion_ratio: 0.0,
            results: Vec::new(),
            no_data: Vec::new(),
            cancelled: Vec::new(),
            started_at: self.clock.now(),
            finished_at: None,
        }
    }

    /// Keep the report in memory, evicting the oldest beyond retention
    fn track(&self, report: ScanReport) {
        let scan_id = report.scan_id;
        if self.reports.insert(scan_id, report).is_some() {
            return;
        }

        let mut order = self.order.lock().unwrap_or_else(|e| e.into_inner());
        order.push_back(scan_id);
        while order.len() > self.retention {
            if let Some(oldest) = order.pop_front() {
                self.reports.remove(&oldest);
            }
        }
    }

    async fn persist(&self, report: &ScanReport) {
        if let Some(pool) = &self.pool {
            if let Err(e) = crate::db::scans::save_scan(pool, report).await {
                error!(scan_id = %report.scan_id, error = %e, "Failed to persist scan summary");
            }
        }
    }
}

/// Fetch every planned class for one identifier and score it
async fn run_pipeline(
    cache: &SignalCache,
    engine: &ScoringEngine,
    universe: &Universe,
    plans: &[ClassPlan],
    identifier: &Identifier,
    routing: Routing,
    as_of: DateTime<Utc>,
) -> PipelineOutcome {
    let fetches = plans.iter().map(|plan| cache.get_or_fetch(identifier, &plan.data_class));
    let fetched = futures::future::join_all(fetches).await;

    let mut vector = SignalVector::new(identifier.clone(), as_of);
    for (plan, result) in plans.iter().zip(fetched) {
        match result {
            Ok(served) => {
                universe.mark_fetched(identifier, &plan.data_class, served.entry.fetched_at);
                let mut reading = served.entry.signal.reading.clone();
                if served.freshness == Freshness::ExpiredFallback {
                    reading.warnings.push("expired_fallback".to_string());
                }
                if served.entry.signal.upstream_stale {
                    reading.warnings.push("upstream_stale".to_string());
                }
                vector = vector.present(&plan.signal, reading);
            }
            Err(e) => {
                let reason = match &e {
                    ScanError::RateLimitExceeded { .. } => format!("rate_limited: {}", e),
                    _ => e.to_string(),
                };
                warn!(identifier = %identifier, data_class = %plan.data_class, %reason, "Signal unavailable");
                vector = vector.absent(&plan.signal, reason);
            }
        }
    }

    let visible = engine.score(&vector, &routing.visible);
    let shadow = routing.shadow.map(|weights| engine.score(&vector, &weights));
    PipelineOutcome { visible, shadow }
}

/// Raw score descending, identifier ascending on ties
pub fn sort_results(results: &mut [ConvictionResult]) {
    results.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.identifier.cmp(&b.identifier))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Recommendation;

    fn result(id: &str, score: f64) -> ConvictionResult {
        ConvictionResult {
            identifier: id.into(),
            raw_score: score,
            contributions: Vec::new(),
            absent: Vec::new(),
            warnings: Vec::new(),
            downgrades: Vec::new(),
            bullish: 0,
            bearish: 0,
            base_tier: Recommendation::Watch,
            tier: Recommendation::Watch,
            weight_version: 1,
            generated_at: Utc::now(),
        }
    }

    #[test]
    fn test_sort_score_desc_then_identifier() {
        let mut results = vec![
            result("DELTA", 50.0),
            result("BRAVO", 70.0),
            result("ALPHA", 50.0),
            result("CHARLIE", 90.0),
        ];
        sort_results(&mut results);
        let order: Vec<&str> = results.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(order, vec!["CHARLIE", "BRAVO", "ALPHA", "DELTA"]);
    }
}
