//! Outcome tracking
//!
//! Every result a scan hands out (visible or shadow) is registered as an
//! [`Emission`]. Realized returns are later recorded against the visible
//! emission once the horizon has fully elapsed, and paired with shadow
//! emissions so the learner can compare weight versions on identical traffic.

pub mod tracker;

pub use tracker::OutcomeTracker;

use crate::types::{ConvictionResult, Identifier, OutcomeLabel, Recommendation, SignalContribution};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sigscan_common::config::OutcomeConfig;
use uuid::Uuid;

/// One scored result as handed out by a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Emission {
    pub scan_id: Uuid,
    pub identifier: Identifier,
    pub weight_version: u64,
    /// False when the result was only scored in shadow
    pub visible: bool,
    pub raw_score: f64,
    pub tier: Recommendation,
    pub contributions: Vec<SignalContribution>,
    pub generated_at: DateTime<Utc>,
}

impl Emission {
    pub fn from_result(scan_id: Uuid, result: &ConvictionResult, visible: bool) -> Self {
        Self {
            scan_id,
            identifier: result.identifier.clone(),
            weight_version: result.weight_version,
            visible,
            raw_score: result.raw_score,
            tier: result.tier,
            contributions: result.contributions.clone(),
            generated_at: result.generated_at,
        }
    }
}

/// Return credited to a score: positive when conviction and return agree
///
/// A score of 50 expresses no view and earns nothing either way.
pub fn attributed_metric(raw_score: f64, realized_return: f64) -> f64 {
    realized_return * (raw_score - 50.0) / 50.0
}

pub fn label_for(realized_return: f64, config: &OutcomeConfig) -> OutcomeLabel {
    if realized_return >= config.win_threshold {
        OutcomeLabel::Win
    } else if realized_return <= config.loss_threshold {
        OutcomeLabel::Loss
    } else {
        OutcomeLabel::Flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attributed_metric_sign() {
        assert!(attributed_metric(80.0, 0.05) > 0.0);
        assert!(attributed_metric(20.0, 0.05) < 0.0);
        assert!(attributed_metric(20.0, -0.05) > 0.0);
        assert_eq!(attributed_metric(50.0, 0.3), 0.0);
        assert!((attributed_metric(100.0, 0.1) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_labels_use_inclusive_thresholds() {
        let config = OutcomeConfig::default();
        assert_eq!(label_for(0.02, &config), OutcomeLabel::Win);
        assert_eq!(label_for(0.019, &config), OutcomeLabel::Flat);
        assert_eq!(label_for(-0.02, &config), OutcomeLabel::Loss);
        assert_eq!(label_for(0.0, &config), OutcomeLabel::Flat);
    }
}
