//! Outcome tracker
//!
//! **Rules for `record_outcome`:**
//! - the horizon must be one of `outcomes.horizons`
//! - the (scan, identifier) must have a visible emission
//! - the horizon must have fully elapsed since the emission (no peeking)
//! - one outcome per (scan, identifier, horizon)
//!
//! `prune` bounds both maps: an emission older than the longest horizon plus
//! `outcomes.retention_grace` can no longer take outcomes, and once it also
//! predates the open gate nothing pairs against it.

use super::{attributed_metric, label_for, Emission};
use crate::types::{Identifier, OutcomeRecord, ScanError, ScanResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sigscan_common::config::OutcomeConfig;
use sigscan_common::events::{EventBus, ScanEvent};
use sigscan_common::time::{to_chrono, SharedClock};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, error, info};
use uuid::Uuid;

type EmissionKey = (Uuid, Identifier);
type OutcomeKey = (Uuid, Identifier, u64);

pub struct OutcomeTracker {
    emissions: DashMap<EmissionKey, Vec<Emission>>,
    outcomes: DashMap<OutcomeKey, OutcomeRecord>,
    config: OutcomeConfig,
    clock: SharedClock,
    pool: Option<SqlitePool>,
    events: EventBus,
}

impl OutcomeTracker {
    pub fn new(config: OutcomeConfig, clock: SharedClock, pool: Option<SqlitePool>, events: EventBus) -> Self {
        Self {
            emissions: DashMap::new(),
            outcomes: DashMap::new(),
            config,
            clock,
            pool,
            events,
        }
    }

    pub fn config(&self) -> &OutcomeConfig {
        &self.config
    }

    /// Restore emissions and outcomes from the database
    pub async fn load(&self) -> ScanResult<(usize, usize)> {
        let Some(pool) = &self.pool else {
            return Ok((0, 0));
        };

        let emissions = crate::db::outcomes::load_emissions(pool).await?;
        let emission_count = emissions.len();
        for emission in emissions {
            self.emissions
                .entry((emission.scan_id, emission.identifier.clone()))
                .or_default()
                .push(emission);
        }

        let outcomes = crate::db::outcomes::load_outcomes(pool).await?;
        let outcome_count = outcomes.len();
        for record in outcomes {
            let key = (record.scan_id, record.identifier.clone(), record.horizon.as_secs());
            self.outcomes.insert(key, record);
        }

        info!(emissions = emission_count, outcomes = outcome_count, "Loaded outcome history");
        Ok((emission_count, outcome_count))
    }

    /// Register a result handed out by a scan. Re-registering the same
    /// version is a no-op.
    pub async fn record_emission(&self, emission: Emission) {
        {
            let mut slot = self
                .emissions
                .entry((emission.scan_id, emission.identifier.clone()))
                .or_default();
            if slot.iter().any(|e| e.weight_version == emission.weight_version) {
                return;
            }
            slot.push(emission.clone());
        }

        if let Some(pool) = &self.pool {
            if let Err(e) = crate::db::outcomes::insert_emission(pool, &emission).await {
                error!(scan_id = %emission.scan_id, identifier = %emission.identifier, error = %e, "Failed to persist emission");
            }
        }
    }

    pub fn visible_emission(&self, scan_id: Uuid, identifier: &Identifier) -> Option<Emission> {
        self.emissions
            .get(&(scan_id, identifier.clone()))
            .and_then(|slot| slot.iter().find(|e| e.visible).cloned())
    }

    /// Every emission (visible and shadow) for one (scan, identifier)
    pub fn emissions_for(&self, scan_id: Uuid, identifier: &Identifier) -> Vec<Emission> {
        self.emissions
            .get(&(scan_id, identifier.clone()))
            .map(|slot| slot.clone())
            .unwrap_or_default()
    }

    /// Record a realized return for a visible result
    pub async fn record_outcome(
        &self,
        identifier: &Identifier,
        scan_id: Uuid,
        realized_return: f64,
        horizon: Duration,
    ) -> ScanResult<OutcomeRecord> {
        if !realized_return.is_finite() {
            return Err(ScanError::InvalidInput("realized_return must be a finite number".to_string()));
        }
        if !self.config.horizons.contains(&horizon) {
            return Err(ScanError::InvalidInput(format!(
                "horizon {} is not configured",
                sigscan_common::human_time::format_duration(horizon)
            )));
        }

        let emission = self
            .visible_emission(scan_id, identifier)
            .ok_or_else(|| ScanError::UnknownEmission {
                scan_id,
                identifier: identifier.clone(),
            })?;

        let now = self.clock.now();
        let due = emission.generated_at + to_chrono(horizon);
        if now < due {
            let remaining_ms = (due - now).num_milliseconds();
            return Err(ScanError::HorizonNotElapsed {
                identifier: identifier.clone(),
                remaining_secs: (remaining_ms + 999) / 1000,
            });
        }

        let record = OutcomeRecord {
            identifier: identifier.clone(),
            scan_id,
            weight_version: emission.weight_version,
            horizon,
            realized_return,
            label: label_for(realized_return, &self.config),
            recorded_at: now,
        };

        match self.outcomes.entry((scan_id, identifier.clone(), horizon.as_secs())) {
            Entry::Occupied(_) => {
                return Err(ScanError::DuplicateOutcome {
                    scan_id,
                    identifier: identifier.clone(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
            }
        }

        if let Some(pool) = &self.pool {
            if let Err(e) = crate::db::outcomes::insert_outcome(pool, &record).await {
                error!(scan_id = %scan_id, identifier = %identifier, error = %e, "Failed to persist outcome");
            }
        }

        debug!(
            scan_id = %scan_id,
            identifier = %identifier,
            realized_return,
            label = record.label.as_str(),
            "Outcome recorded"
        );
        self.events.emit_lossy(ScanEvent::OutcomeRecorded {
            scan_id,
            identifier: identifier.to_string(),
            horizon_secs: horizon.as_secs(),
            label: record.label.as_str().to_string(),
            timestamp: now,
        });

        Ok(record)
    }

    /// Attributed-metric differences (candidate − baseline) for outcomes at
    /// `horizon` whose emissions of both versions were generated at or after
    /// `since`
    pub fn paired_samples(&self, candidate: u64, baseline: u64, horizon: Duration, since: DateTime<Utc>) -> Vec<f64> {
        let horizon_secs = horizon.as_secs();
        let mut samples = Vec::new();

        for item in self.outcomes.iter() {
            let (scan_id, identifier, secs) = item.key();
            if *secs != horizon_secs {
                continue;
            }
            let Some(slot) = self.emissions.get(&(*scan_id, identifier.clone())) else {
                continue;
            };
            let find = |version: u64| {
                slot.iter()
                    .find(|e| e.weight_version == version && e.generated_at >= since)
            };
            if let (Some(c), Some(b)) = (find(candidate), find(baseline)) {
                let realized = item.value().realized_return;
                samples.push(attributed_metric(c.raw_score, realized) - attributed_metric(b.raw_score, realized));
            }
        }

        samples
    }

    /// Drop emission groups whose newest emission predates both the
    /// retention cutoff and `gate_since`, together with their outcomes.
    /// Returns the (emissions, outcomes) removed from memory.
    pub async fn prune(&self, gate_since: DateTime<Utc>) -> (usize, usize) {
        let longest = self.config.horizons.iter().copied().max().unwrap_or_default();
        let retention_cutoff = self.clock.now() - to_chrono(longest + self.config.retention_grace);
        let cutoff = retention_cutoff.min(gate_since);

        let mut emissions = 0;
        self.emissions.retain(|_, slot| {
            let keep = slot.iter().any(|e| e.generated_at >= cutoff);
            if !keep {
                emissions += slot.len();
            }
            keep
        });

        let mut outcomes = 0;
        self.outcomes.retain(|(scan_id, identifier, _), _| {
            let keep = self.emissions.contains_key(&(*scan_id, identifier.clone()));
            if !keep {
                outcomes += 1;
            }
            keep
        });

        if let Some(pool) = &self.pool {
            if let Err(e) = crate::db::outcomes::prune_before(pool, cutoff).await {
                error!(error = %e, "Failed to prune outcome history");
            }
        }

        if emissions > 0 || outcomes > 0 {
            info!(emissions, outcomes, cutoff = %cutoff, "Pruned outcome history");
        }
        (emissions, outcomes)
    }

    pub fn outcome_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn emission_count(&self) -> usize {
        self.emissions.iter().map(|slot| slot.len()).sum()
    }
}
