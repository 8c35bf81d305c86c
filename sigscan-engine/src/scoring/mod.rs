// Signal scoring engine
//
// Pure, deterministic reduction of a SignalVector under a WeightVector.
//
// Algorithm:
// 1. Validate each present signal; invalid ones become absent with a warning
// 2. Renormalize the weights of the remaining signals to sum to 1
// 3. Raw score = Σ effective_weight * clamp(score, 0, 100)
// 4. Tier from score thresholds and bullish/bearish counts (boundary → lower tier)
// 5. Each distinct triggered warning kind downgrades one tier
//
// No present signal (or no weighted mass) yields NoData, never a zero score.

pub mod warnings;

use crate::types::{
    AbsentSignal, ConvictionResult, NoDataReport, Recommendation, ScoreOutcome, SignalContribution,
    SignalReading, SignalSlot, SignalVector, WeightVector,
};
use sigscan_common::config::{ScoringConfig, TierThresholds};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use warnings::{triggered_kinds, WarningRule};

/// Scoring engine
///
/// Holds only configuration; `score` has no side effects beyond logging.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    thresholds: TierThresholds,
    bullish_cutoff: f64,
    bearish_cutoff: f64,
    strong_buy_min_bullish: usize,
    buy_min_bullish: usize,
    bearish_veto: usize,
    score_tolerance: f64,
    min_confidence: f64,
    rules: Vec<WarningRule>,
}

impl Default for ScoringEngine {
    fn default() -> Self {
        Self::from_config(&ScoringConfig::default())
    }
}

impl ScoringEngine {
    pub fn from_config(config: &ScoringConfig) -> Self {
        Self {
            thresholds: config.thresholds.clone(),
            bullish_cutoff: config.bullish_cutoff,
            bearish_cutoff: config.bearish_cutoff,
            strong_buy_min_bullish: config.strong_buy_min_bullish,
            buy_min_bullish: config.buy_min_bullish,
            bearish_veto: config.bearish_veto,
            score_tolerance: config.score_tolerance,
            min_confidence: config.min_confidence,
            rules: config.warnings.iter().map(WarningRule::from).collect(),
        }
    }

    /// Score one identifier's signals under `weights`
    pub fn score(&self, vector: &SignalVector, weights: &WeightVector) -> ScoreOutcome {
        let mut absent = Vec::new();
        let mut warnings = Vec::new();
        let mut present: BTreeMap<&str, (f64, &SignalReading)> = BTreeMap::new();

        for (name, slot) in &vector.signals {
            match slot {
                SignalSlot::Absent { reason } => {
                    absent.push(AbsentSignal {
                        signal: name.clone(),
                        reason: reason.clone(),
                    });
                }
                SignalSlot::Present(reading) => match self.validate(reading) {
                    Ok(_) if !weights.weights().contains_key(name) => {
                        warnings.push(format!("unweighted_signal:{}", name));
                        absent.push(AbsentSignal {
                            signal: name.clone(),
                            reason: format!("no weight for signal in v{}", weights.version()),
                        });
                    }
                    Ok(score) => {
                        present.insert(name.as_str(), (score, reading));
                    }
                    Err(reason) => {
                        warn!(
                            identifier = %vector.identifier,
                            signal = %name,
                            reason = %reason,
                            "Excluding invalid signal"
                        );
                        warnings.push(format!("invalid_signal:{}", name));
                        absent.push(AbsentSignal {
                            signal: name.clone(),
                            reason,
                        });
                    }
                },
            }
        }

        let mass: f64 = present.keys().map(|name| weights.weight(name)).sum();
        if present.is_empty() || mass <= 0.0 {
            debug!(identifier = %vector.identifier, "No usable signals");
            return ScoreOutcome::NoData(NoDataReport {
                identifier: vector.identifier.clone(),
                reasons: absent,
                generated_at: vector.as_of,
            });
        }

        let mut contributions = Vec::with_capacity(present.len());
        let mut raw_score: f64 = 0.0;
        let mut bullish = 0;
        let mut bearish = 0;

        for (name, (score, reading)) in &present {
            let weight = weights.weight(name);
            let effective_weight = weight / mass;
            let contribution = effective_weight * score;
            raw_score += contribution;

            if *score > self.bullish_cutoff {
                bullish += 1;
            }
            if *score < self.bearish_cutoff {
                bearish += 1;
            }
            for provider_warning in &reading.warnings {
                warnings.push(format!("{}:{}", name, provider_warning));
            }

            contributions.push(SignalContribution {
                signal: name.to_string(),
                score: *score,
                weight,
                effective_weight,
                contribution,
            });
        }
        let raw_score = raw_score.clamp(0.0, 100.0);

        let base_tier = self.base_tier(raw_score, bullish, bearish);
        let downgrades: Vec<String> = triggered_kinds(&self.rules, &present)
            .into_iter()
            .map(str::to_string)
            .collect();
        let tier = downgrades.iter().fold(base_tier, |tier, _| tier.downgrade());
        warnings.extend(downgrades.iter().cloned());

        debug!(
            identifier = %vector.identifier,
            raw_score,
            base_tier = base_tier.as_str(),
            tier = tier.as_str(),
            weight_version = weights.version(),
            "Scored identifier"
        );

        ScoreOutcome::Conviction(ConvictionResult {
            identifier: vector.identifier.clone(),
            raw_score,
            contributions,
            absent,
            warnings,
            downgrades,
            bullish,
            bearish,
            base_tier,
            tier,
            weight_version: weights.version(),
            generated_at: vector.as_of,
        })
    }

    /// Clamped score, or the reason the reading is unusable
    fn validate(&self, reading: &SignalReading) -> Result<f64, String> {
        if !reading.score.is_finite() {
            return Err("score is not a finite number".to_string());
        }
        if reading.score < -self.score_tolerance || reading.score > 100.0 + self.score_tolerance {
            return Err(format!("score {} outside [0, 100]", reading.score));
        }
        if !reading.confidence.is_finite() || reading.confidence < self.min_confidence {
            return Err(format!("confidence {} below minimum", reading.confidence));
        }
        Ok(reading.score.clamp(0.0, 100.0))
    }

    /// Tier before warnings. Every comparison is strict, so a score exactly
    /// on a threshold lands in the lower tier.
    fn base_tier(&self, score: f64, bullish: usize, bearish: usize) -> Recommendation {
        let t = &self.thresholds;
        let tier = if score > t.strong_buy && bullish >= self.strong_buy_min_bullish {
            Recommendation::StrongBuy
        } else if score > t.buy && bullish >= self.buy_min_bullish {
            Recommendation::Buy
        } else if score > t.watch {
            Recommendation::Watch
        } else if score > t.neutral {
            Recommendation::Neutral
        } else {
            Recommendation::Avoid
        };

        if bearish >= self.bearish_veto && tier > Recommendation::Watch {
            Recommendation::Watch
        } else {
            tier
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identifier;
    use chrono::Utc;

    fn weights(pairs: &[(&str, f64)]) -> WeightVector {
        let raw = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        WeightVector::normalized(7, Utc::now(), raw).unwrap()
    }

    fn scenario_weights() -> WeightVector {
        weights(&[
            ("insider", 0.25),
            ("options", 0.25),
            ("patents", 0.12),
            ("contracts", 0.13),
            ("sentiment", 0.10),
            ("technical", 0.15),
        ])
    }

    fn scenario_vector() -> SignalVector {
        SignalVector::new(Identifier::new("ACME"), Utc::now())
            .present("insider", SignalReading::new(80.0))
            .present("options", SignalReading::new(70.0))
            .absent("patents", "upstream unavailable")
            .present("contracts", SignalReading::new(60.0))
            .present("sentiment", SignalReading::new(90.0).with_attribute("volume_ratio", 3.0))
            .present("technical", SignalReading::new(40.0))
    }

    #[test]
    fn test_missing_signal_weight_redistributed() {
        let engine = ScoringEngine::default();
        let outcome = engine.score(&scenario_vector(), &scenario_weights());
        let result = outcome.conviction().unwrap();

        assert!((result.raw_score - 60.3 / 0.88).abs() < 1e-9);
        let total: f64 = result.contributions.iter().map(|c| c.effective_weight).sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(result.absent.len(), 1);
        assert_eq!(result.absent[0].signal, "patents");
    }

    #[test]
    fn test_euphoric_sentiment_downgrades_once() {
        let engine = ScoringEngine::default();
        let result = engine
            .score(&scenario_vector(), &scenario_weights())
            .conviction()
            .cloned()
            .unwrap();

        assert_eq!(result.base_tier, Recommendation::Buy);
        assert_eq!(result.tier, Recommendation::Watch);
        assert_eq!(result.downgrades, vec!["euphoric_sentiment".to_string()]);
        assert_eq!(result.weight_version, 7);
    }

    #[test]
    fn test_no_present_signals_is_no_data() {
        let engine = ScoringEngine::default();
        let vector = SignalVector::new(Identifier::new("ZERO"), Utc::now())
            .absent("insider", "timeout")
            .absent("options", "rate limited");

        match engine.score(&vector, &scenario_weights()) {
            ScoreOutcome::NoData(report) => assert_eq!(report.reasons.len(), 2),
            other => panic!("expected NoData, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_weight_mass_is_no_data() {
        let engine = ScoringEngine::default();
        let w = weights(&[("insider", 1.0), ("options", 0.0)]);
        let vector = SignalVector::new(Identifier::new("X"), Utc::now())
            .present("options", SignalReading::new(90.0));
        assert!(engine.score(&vector, &w).is_no_data());
    }

    #[test]
    fn test_boundary_score_goes_to_lower_tier() {
        let engine = ScoringEngine::default();
        let w = weights(&[("a", 1.0)]);

        let at_watch = SignalVector::new(Identifier::new("B"), Utc::now())
            .present("a", SignalReading::new(45.0));
        let result = engine.score(&at_watch, &w).conviction().cloned().unwrap();
        assert_eq!(result.tier, Recommendation::Neutral);

        let above = SignalVector::new(Identifier::new("B"), Utc::now())
            .present("a", SignalReading::new(45.01));
        let result = engine.score(&above, &w).conviction().cloned().unwrap();
        assert_eq!(result.tier, Recommendation::Watch);
    }

    #[test]
    fn test_out_of_tolerance_score_excluded() {
        let engine = ScoringEngine::default();
        let w = weights(&[("a", 0.5), ("b", 0.5)]);
        let vector = SignalVector::new(Identifier::new("V"), Utc::now())
            .present("a", SignalReading::new(250.0))
            .present("b", SignalReading::new(102.0));

        let result = engine.score(&vector, &w).conviction().cloned().unwrap();
        assert_eq!(result.raw_score, 100.0);
        assert_eq!(result.contributions.len(), 1);
        assert!(result.warnings.contains(&"invalid_signal:a".to_string()));
    }

    #[test]
    fn test_bearish_veto_caps_at_watch() {
        let engine = ScoringEngine::default();
        let w = weights(&[("a", 0.3), ("b", 0.3), ("c", 0.3), ("d", 0.05), ("e", 0.05)]);
        let vector = SignalVector::new(Identifier::new("V"), Utc::now())
            .present("a", SignalReading::new(100.0))
            .present("b", SignalReading::new(100.0))
            .present("c", SignalReading::new(100.0))
            .present("d", SignalReading::new(10.0))
            .present("e", SignalReading::new(10.0));

        let result = engine.score(&vector, &w).conviction().cloned().unwrap();
        assert!(result.raw_score > 75.0);
        assert_eq!(result.bullish, 3);
        assert_eq!(result.bearish, 2);
        assert_eq!(result.tier, Recommendation::Watch);
        assert!(result.downgrades.is_empty());
    }

    #[test]
    fn test_distinct_warning_kinds_compound() {
        let engine = ScoringEngine::default();
        let vector = SignalVector::new(Identifier::new("HOT"), Utc::now())
            .present("insider", SignalReading::new(95.0))
            .present("options", SignalReading::new(95.0))
            .present("sentiment", SignalReading::new(95.0).with_attribute("volume_ratio", 5.0))
            .present("technical", SignalReading::new(95.0).with_attribute("extension_pct", 40.0));

        let result = engine
            .score(&vector, &scenario_weights())
            .conviction()
            .cloned()
            .unwrap();
        assert_eq!(result.base_tier, Recommendation::StrongBuy);
        assert_eq!(result.downgrades.len(), 2);
        assert_eq!(result.tier, Recommendation::Watch);
    }
}
