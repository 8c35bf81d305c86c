//! Property tests for the scoring engine

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use sigscan_engine::scoring::ScoringEngine;
use sigscan_engine::types::{Identifier, ScoreOutcome, SignalReading, SignalVector, WeightVector};
use std::collections::BTreeMap;

const SIGNALS: [&str; 6] = ["insider", "options", "patents", "contracts", "sentiment", "technical"];

fn weights(raw: &[f64]) -> WeightVector {
    let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let map: BTreeMap<String, f64> = SIGNALS.iter().zip(raw).map(|(s, w)| (s.to_string(), *w)).collect();
    WeightVector::normalized(1, at, map).unwrap()
}

/// Each signal is either present with a score or absent
fn vector(slots: &[Option<f64>]) -> SignalVector {
    let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
    SIGNALS
        .iter()
        .zip(slots)
        .fold(SignalVector::new(Identifier::new("PROP"), at), |v, (name, slot)| match slot {
            Some(score) => v.present(name, SignalReading::new(*score)),
            None => v.absent(name, "missing"),
        })
}

fn slots() -> impl Strategy<Value = Vec<Option<f64>>> {
    prop::collection::vec(prop::option::of(0.0f64..=100.0), SIGNALS.len())
}

fn raw_weights() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.01f64..10.0, SIGNALS.len())
}

proptest! {
    #[test]
    fn score_is_bounded_and_weights_renormalize(slots in slots(), raw in raw_weights()) {
        let engine = ScoringEngine::default();
        let outcome = engine.score(&vector(&slots), &weights(&raw));
        let present = slots.iter().filter(|s| s.is_some()).count();

        match outcome {
            ScoreOutcome::Conviction(result) => {
                prop_assert!(present > 0);
                prop_assert!((0.0..=100.0).contains(&result.raw_score));
                let total: f64 = result.contributions.iter().map(|c| c.effective_weight).sum();
                prop_assert!((total - 1.0).abs() < 1e-9);
                prop_assert_eq!(result.contributions.len(), present);
                prop_assert_eq!(result.absent.len(), SIGNALS.len() - present);
            }
            ScoreOutcome::NoData(report) => {
                prop_assert_eq!(present, 0);
                prop_assert_eq!(report.reasons.len(), SIGNALS.len());
            }
        }
    }

    #[test]
    fn score_lies_between_extreme_present_scores(slots in slots(), raw in raw_weights()) {
        let engine = ScoringEngine::default();
        let present: Vec<f64> = slots.iter().flatten().copied().collect();
        prop_assume!(!present.is_empty());

        let outcome = engine.score(&vector(&slots), &weights(&raw));
        let result = outcome.conviction().unwrap();
        let lo = present.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = present.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        prop_assert!(result.raw_score >= lo - 1e-9 && result.raw_score <= hi + 1e-9);
    }

    #[test]
    fn scoring_is_deterministic(slots in slots(), raw in raw_weights()) {
        let engine = ScoringEngine::default();
        let v = vector(&slots);
        let w = weights(&raw);
        prop_assert_eq!(engine.score(&v, &w), engine.score(&v, &w));
    }

    #[test]
    fn at_most_one_downgrade_per_warning_kind(slots in slots(), raw in raw_weights()) {
        let engine = ScoringEngine::default();
        if let ScoreOutcome::Conviction(result) = engine.score(&vector(&slots), &weights(&raw)) {
            let mut kinds = result.downgrades.clone();
            kinds.sort();
            kinds.dedup();
            prop_assert_eq!(kinds.len(), result.downgrades.len());
        }
    }
}
