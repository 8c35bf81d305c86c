//! Scanner service wiring
//!
//! Owns one instance of every component and the background loops. HTTP
//! handlers and the binary talk to the scanner only through this type.

use crate::cache::SignalCache;
use crate::fetch::FetchRouter;
use crate::learner::{GateDecision, WeightLearner};
use crate::orchestrator::ScanOrchestrator;
use crate::outcomes::OutcomeTracker;
use crate::types::{Identifier, OutcomeRecord, ScanError, ScanMode, ScanReport, ScanResult};
use crate::universe::Universe;
use chrono::{DateTime, Utc};
use sigscan_common::config::{load_universe_file, SigscanConfig};
use sigscan_common::events::{BreakerState, EventBus};
use sigscan_common::time::SharedClock;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct ScannerService {
    config: SigscanConfig,
    router: Arc<FetchRouter>,
    cache: SignalCache,
    tracker: Arc<OutcomeTracker>,
    learner: Arc<WeightLearner>,
    universe: Arc<Universe>,
    orchestrator: Arc<ScanOrchestrator>,
    clock: SharedClock,
    events: EventBus,
    started_at: DateTime<Utc>,
    last_error: std::sync::Mutex<Option<String>>,
}

impl ScannerService {
    /// Build every component and restore persisted state
    ///
    /// Fails on anything that would leave the service inconsistent: an
    /// unreadable learner state, unloadable outcomes or durable cache.
    pub async fn build(
        config: SigscanConfig,
        router: Arc<FetchRouter>,
        pool: Option<SqlitePool>,
        clock: SharedClock,
        events: EventBus,
    ) -> ScanResult<Arc<Self>> {
        let cache = SignalCache::new(router.clone(), &config, clock.clone(), pool.clone(), events.clone());
        let durable = cache.load_durable().await?;

        let tracker = Arc::new(OutcomeTracker::new(
            config.outcomes.clone(),
            clock.clone(),
            pool.clone(),
            events.clone(),
        ));
        let (emissions, outcomes) = tracker.load().await?;

        let learner = Arc::new(
            WeightLearner::bootstrap(&config, tracker.clone(), pool.clone(), clock.clone(), events.clone()).await?,
        );
        let universe = Arc::new(Universe::from_entries(&config.universe, clock.now()));
        if let Some(path) = &config.service.universe_file {
            universe.load(&load_universe_file(path)?, clock.now());
        }

        let orchestrator = Arc::new(ScanOrchestrator::new(
            &config,
            cache.clone(),
            learner.clone(),
            tracker.clone(),
            universe.clone(),
            pool,
            clock.clone(),
            events.clone(),
        ));

        info!(
            identifiers = universe.len(),
            durable_entries = durable,
            emissions,
            outcomes,
            active_weights = learner.snapshot().active.version(),
            "Scanner service ready"
        );

        Ok(Arc::new(Self {
            started_at: clock.now(),
            config,
            router,
            cache,
            tracker,
            learner,
            universe,
            orchestrator,
            clock,
            events,
            last_error: std::sync::Mutex::new(None),
        }))
    }

    /// Start cache maintenance, the learning loop and, with a universe file,
    /// the universe refresh loop; all stop on `cancel`
    pub fn spawn_background(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = self.cache.spawn_background(cancel.clone());

        let service = Arc::clone(self);
        let period = self.config.service.learning_interval;
        let learning_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = learning_cancel.cancelled() => break,
                    _ = tick.tick() => service.learning_step().await,
                }
            }
            debug!("Learning loop stopped");
        }));

        if self.config.service.universe_file.is_some() {
            let service = Arc::clone(self);
            let period = self.config.service.universe_refresh;
            handles.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            if let Err(e) = service.reload_universe() {
                                service.note_error("universe reload", &e);
                            }
                        }
                    }
                }
                debug!("Universe refresh loop stopped");
            }));
        }
        handles
    }

    /// Re-read the universe file: new identifiers are added and known ones
    /// get their attributes refreshed. Returns how many were added.
    pub fn reload_universe(&self) -> ScanResult<usize> {
        let Some(path) = &self.config.service.universe_file else {
            return Ok(0);
        };
        let entries = load_universe_file(path)?;
        let added = self.universe.load(&entries, self.clock.now());
        debug!(entries = entries.len(), added, "Universe reloaded");
        Ok(added)
    }

    /// One evaluate pass; proposes a new candidate when none is in flight.
    /// Outcome history no open gate can still read is pruned first.
    pub async fn learning_step(&self) {
        let status = self.learner.status().await;
        let gate_since = match status.candidate_version {
            Some(_) => status.stage_started_at,
            None => self.clock.now(),
        };
        self.tracker.prune(gate_since).await;

        match self.learner.evaluate().await {
            Ok(GateDecision::Idle) => {
                if self.learner.snapshot().frozen || self.tracker.outcome_count() == 0 {
                    return;
                }
                match self.learner.propose().await {
                    Ok(candidate) => info!(candidate = candidate.version(), "Learning loop proposed candidate"),
                    Err(ScanError::LearnerBusy(reason)) => debug!(%reason, "Learner busy"),
                    Err(e) => self.note_error("learner propose", &e),
                }
            }
            Ok(decision) => debug!(?decision, "Learning loop evaluated candidate"),
            Err(e @ ScanError::LearnerRegression { .. }) => {
                warn!(error = %e, "Candidate regressed during rollout; learner frozen");
                self.set_last_error(e.to_string());
            }
            Err(e) => self.note_error("learner evaluate", &e),
        }
    }

    pub fn run_scan(&self, mode: ScanMode, subset: Option<Vec<Identifier>>) -> ScanResult<Uuid> {
        self.orchestrator.run_scan(mode, subset)
    }

    pub async fn get_results(&self, scan_id: Uuid) -> ScanResult<ScanReport> {
        self.orchestrator.get_results(scan_id).await
    }

    /// Record a realized outcome and feed it to the learner
    pub async fn record_outcome(
        &self,
        identifier: &Identifier,
        scan_id: Uuid,
        realized_return: f64,
        horizon: Duration,
    ) -> ScanResult<OutcomeRecord> {
        let record = self
            .tracker
            .record_outcome(identifier, scan_id, realized_return, horizon)
            .await?;
        if let Some(emission) = self.tracker.visible_emission(scan_id, identifier) {
            self.learner.observe(&emission, &record).await;
        }
        Ok(record)
    }

    pub fn learner(&self) -> &Arc<WeightLearner> {
        &self.learner
    }

    pub fn cache(&self) -> &SignalCache {
        &self.cache
    }

    pub fn universe(&self) -> &Arc<Universe> {
        &self.universe
    }

    pub fn tracker(&self) -> &Arc<OutcomeTracker> {
        &self.tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &SigscanConfig {
        &self.config
    }

    pub fn source_health(&self) -> Vec<(crate::types::SourceId, BreakerState)> {
        self.router.source_health()
    }

    pub fn uptime_seconds(&self) -> u64 {
        (self.clock.now() - self.started_at).num_seconds().max(0) as u64
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_last_error(&self, message: String) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }

    fn note_error(&self, context: &str, err: &ScanError) {
        error!(error = %err, "{} failed", context);
        self.set_last_error(format!("{}: {}", context, err));
    }
}
