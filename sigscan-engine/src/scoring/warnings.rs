// Warning rules
//
// A rule watches one signal and fires when every condition it sets holds.
// Rules are grouped by kind: however many rules of one kind fire, the kind
// costs exactly one tier.

use crate::types::SignalReading;
use sigscan_common::config::WarningRuleConfig;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq)]
pub struct WarningRule {
    pub kind: String,
    pub signal: String,
    pub min_score: Option<f64>,
    /// (attribute name, minimum value)
    pub attribute: Option<(String, f64)>,
    pub provider_flag: Option<String>,
}

impl From<&WarningRuleConfig> for WarningRule {
    fn from(config: &WarningRuleConfig) -> Self {
        Self {
            kind: config.kind.clone(),
            signal: config.signal.clone(),
            min_score: config.min_score,
            attribute: config.attribute.clone().zip(config.attribute_min),
            provider_flag: config.provider_flag.clone(),
        }
    }
}

impl WarningRule {
    /// `score` is the validated, clamped score of the watched signal
    pub fn fires(&self, score: f64, reading: &SignalReading) -> bool {
        if self.min_score.is_none() && self.attribute.is_none() && self.provider_flag.is_none() {
            return false;
        }

        if let Some(min) = self.min_score {
            if score < min {
                return false;
            }
        }

        if let Some((name, min)) = &self.attribute {
            match reading.attributes.get(name) {
                Some(value) if value.is_finite() && value >= min => {}
                _ => return false,
            }
        }

        if let Some(flag) = &self.provider_flag {
            if !reading.warnings.iter().any(|w| w == flag) {
                return false;
            }
        }

        true
    }
}

/// Distinct warning kinds triggered by the present signals
pub fn triggered_kinds<'a>(
    rules: &'a [WarningRule],
    present: &BTreeMap<&str, (f64, &SignalReading)>,
) -> BTreeSet<&'a str> {
    rules
        .iter()
        .filter(|rule| {
            present
                .get(rule.signal.as_str())
                .is_some_and(|(score, reading)| rule.fires(*score, reading))
        })
        .map(|rule| rule.kind.as_str())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn euphoric() -> WarningRule {
        WarningRule {
            kind: "euphoric_sentiment".to_string(),
            signal: "sentiment".to_string(),
            min_score: Some(85.0),
            attribute: Some(("volume_ratio".to_string(), 2.0)),
            provider_flag: None,
        }
    }

    #[test]
    fn test_all_conditions_required() {
        let rule = euphoric();
        let loud = SignalReading::new(90.0).with_attribute("volume_ratio", 3.1);
        let quiet = SignalReading::new(90.0).with_attribute("volume_ratio", 1.2);

        assert!(rule.fires(90.0, &loud));
        assert!(!rule.fires(90.0, &quiet));
        assert!(!rule.fires(80.0, &loud));
        assert!(!rule.fires(90.0, &SignalReading::new(90.0)));
    }

    #[test]
    fn test_provider_flag_rule() {
        let rule = WarningRule {
            kind: "halted".to_string(),
            signal: "technical".to_string(),
            min_score: None,
            attribute: None,
            provider_flag: Some("trading_halt".to_string()),
        };
        assert!(rule.fires(50.0, &SignalReading::new(50.0).with_warning("trading_halt")));
        assert!(!rule.fires(50.0, &SignalReading::new(50.0)));
    }

    #[test]
    fn test_same_kind_counted_once() {
        let mut second = euphoric();
        second.min_score = Some(50.0);
        second.attribute = None;
        let rules = vec![euphoric(), second];

        let reading = SignalReading::new(95.0).with_attribute("volume_ratio", 4.0);
        let mut present = BTreeMap::new();
        present.insert("sentiment", (95.0, &reading));

        let kinds = triggered_kinds(&rules, &present);
        assert_eq!(kinds.len(), 1);
    }
}
