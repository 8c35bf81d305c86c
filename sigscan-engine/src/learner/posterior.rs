//! Per-signal Beta posteriors and Thompson-sampled proposals

use crate::types::{SignalName, WeightError, WeightVector};
use chrono::{DateTime, Utc};
use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sigscan_common::config::LearnerConfig;
use statrs::distribution::Beta;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BetaPosterior {
    pub alpha: f64,
    pub beta: f64,
}

impl BetaPosterior {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Draw one sample; falls back to the mean if the parameters are unusable
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match Beta::new(self.alpha, self.beta) {
            Ok(dist) => dist.sample(rng),
            Err(_) => self.mean(),
        }
    }

    /// Shrink accumulated evidence toward the prior
    fn decay_toward(&mut self, prior: &BetaPosterior, factor: f64) {
        self.alpha = prior.alpha + (self.alpha - prior.alpha) * factor;
        self.beta = prior.beta + (self.beta - prior.beta) * factor;
    }
}

/// Posterior per signal, all starting from the configured prior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posteriors {
    prior: BetaPosterior,
    signals: BTreeMap<SignalName, BetaPosterior>,
}

impl Posteriors {
    pub fn from_prior<'a>(config: &LearnerConfig, signals: impl IntoIterator<Item = &'a String>) -> Self {
        let prior = BetaPosterior::new(config.prior_alpha, config.prior_beta);
        Self {
            prior,
            signals: signals.into_iter().map(|s| (s.clone(), prior)).collect(),
        }
    }

    pub fn get(&self, signal: &str) -> Option<&BetaPosterior> {
        self.signals.get(signal)
    }

    pub fn means(&self) -> BTreeMap<SignalName, f64> {
        self.signals.iter().map(|(k, p)| (k.clone(), p.mean())).collect()
    }

    /// Credit one signal with `mass` of evidence, in favor when `agreed`
    pub fn observe(&mut self, signal: &str, agreed: bool, mass: f64, decay: f64) {
        if !(mass.is_finite() && mass > 0.0) {
            return;
        }
        let prior = self.prior;
        let posterior = self.signals.entry(signal.to_string()).or_insert(prior);
        if decay < 1.0 {
            posterior.decay_toward(&prior, decay);
        }
        if agreed {
            posterior.alpha += mass;
        } else {
            posterior.beta += mass;
        }
    }

    /// Sample a candidate vector and blend it with `active`
    ///
    /// Samples are normalized, floored at `exploration_floor`, and the result
    /// moves at most `max_step` of the way from the active weights.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        active: &WeightVector,
        config: &LearnerConfig,
        version: u64,
        at: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<WeightVector, WeightError> {
        let sampled: BTreeMap<SignalName, f64> = active
            .weights()
            .keys()
            .map(|signal| {
                let posterior = self.signals.get(signal).copied().unwrap_or(self.prior);
                (signal.clone(), posterior.sample(rng))
            })
            .collect();

        let total: f64 = sampled.values().sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(WeightError::ZeroSum);
        }

        let floor = config.exploration_floor;
        let free_mass = 1.0 - floor * sampled.len() as f64;
        let blended = sampled
            .into_iter()
            .map(|(signal, theta)| {
                let explored = floor + free_mass * theta / total;
                let current = active.weight(&signal);
                let next = current + config.max_step * (explored - current);
                (signal, next.max(0.0))
            })
            .collect();

        WeightVector::normalized(version, at, blended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> LearnerConfig {
        LearnerConfig::default()
    }

    fn active() -> WeightVector {
        WeightVector::normalized(1, Utc::now(), config().initial_weights).unwrap()
    }

    #[test]
    fn test_observe_moves_mean() {
        let cfg = config();
        let names: Vec<String> = cfg.initial_weights.keys().cloned().collect();
        let mut posteriors = Posteriors::from_prior(&cfg, &names);
        let before = posteriors.get("insider").unwrap().mean();

        posteriors.observe("insider", true, 0.5, 1.0);
        assert!(posteriors.get("insider").unwrap().mean() > before);

        posteriors.observe("options", false, 0.5, 1.0);
        assert!(posteriors.get("options").unwrap().mean() < before);

        // Zero or invalid mass is ignored
        posteriors.observe("patents", true, 0.0, 1.0);
        posteriors.observe("patents", true, f64::NAN, 1.0);
        assert_eq!(posteriors.get("patents").unwrap().mean(), before);
    }

    #[test]
    fn test_decay_pulls_toward_prior() {
        let cfg = config();
        let names: Vec<String> = cfg.initial_weights.keys().cloned().collect();
        let mut posteriors = Posteriors::from_prior(&cfg, &names);
        for _ in 0..10 {
            posteriors.observe("insider", true, 1.0, 1.0);
        }
        let strong = posteriors.get("insider").unwrap().alpha;
        posteriors.observe("insider", false, 1.0, 0.5);
        let decayed = posteriors.get("insider").unwrap();
        assert!((decayed.alpha - (2.0 + (strong - 2.0) * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn test_proposal_is_normalized_and_bounded() {
        let cfg = config();
        let names: Vec<String> = cfg.initial_weights.keys().cloned().collect();
        let posteriors = Posteriors::from_prior(&cfg, &names);
        let active = active();
        let mut rng = StdRng::seed_from_u64(7);

        for version in 2..50 {
            let candidate = posteriors.propose(&active, &cfg, version, Utc::now(), &mut rng).unwrap();
            let sum: f64 = candidate.weights().values().sum();
            assert!((sum - 1.0).abs() < 1e-9);
            assert_eq!(candidate.version(), version);
            for (signal, weight) in candidate.weights() {
                let current = active.weight(signal);
                assert!(*weight > 0.0);
                assert!((weight - current).abs() <= cfg.max_step + 1e-9);
            }
        }
    }
}
