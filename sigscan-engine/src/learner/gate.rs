//! Regression gate over paired attributed-metric differences

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};

/// Summary of a paired one-sided test of H1: candidate is worse
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateStatistics {
    pub samples: usize,
    pub mean_diff: f64,
    pub std_dev: f64,
    pub p_value: f64,
}

impl GateStatistics {
    /// None below two samples
    pub fn from_samples(diffs: &[f64]) -> Option<Self> {
        let n = diffs.len();
        if n < 2 {
            return None;
        }

        let mean = diffs.iter().sum::<f64>() / n as f64;
        let variance = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
        let std_dev = variance.sqrt();

        let p_value = if std_dev <= f64::EPSILON {
            // No spread: any drop at all is certain
            if mean < 0.0 {
                0.0
            } else {
                1.0
            }
        } else {
            let t = mean / (std_dev / (n as f64).sqrt());
            match StudentsT::new(0.0, 1.0, (n - 1) as f64) {
                Ok(dist) => dist.cdf(t),
                Err(_) => 1.0,
            }
        };

        Some(Self {
            samples: n,
            mean_diff: mean,
            std_dev,
            p_value,
        })
    }

    pub fn significant_regression(&self, significance: f64) -> bool {
        self.p_value < significance
    }

    /// Mean drop larger than the rollback threshold
    pub fn beyond_threshold(&self, rollback_threshold: f64) -> bool {
        self.mean_diff < -rollback_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_few_samples() {
        assert!(GateStatistics::from_samples(&[]).is_none());
        assert!(GateStatistics::from_samples(&[0.1]).is_none());
    }

    #[test]
    fn test_clear_regression_is_significant() {
        let diffs: Vec<f64> = (0..30).map(|i| -0.05 + (i % 3) as f64 * 0.001).collect();
        let stats = GateStatistics::from_samples(&diffs).unwrap();
        assert!(stats.mean_diff < 0.0);
        assert!(stats.significant_regression(0.05));
        assert!(stats.beyond_threshold(0.02));
    }

    #[test]
    fn test_improvement_is_not_a_regression() {
        let diffs: Vec<f64> = (0..30).map(|i| 0.03 + (i % 5) as f64 * 0.002).collect();
        let stats = GateStatistics::from_samples(&diffs).unwrap();
        assert!(stats.p_value > 0.5);
        assert!(!stats.significant_regression(0.05));
        assert!(!stats.beyond_threshold(0.02));
    }

    #[test]
    fn test_noise_around_zero_passes() {
        let diffs: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 0.01 } else { -0.01 }).collect();
        let stats = GateStatistics::from_samples(&diffs).unwrap();
        assert!(stats.mean_diff.abs() < 1e-12);
        assert!(!stats.significant_regression(0.05));
    }

    #[test]
    fn test_constant_differences() {
        let down = GateStatistics::from_samples(&[-0.01; 5]).unwrap();
        assert_eq!(down.p_value, 0.0);
        let flat = GateStatistics::from_samples(&[0.0; 5]).unwrap();
        assert_eq!(flat.p_value, 1.0);
    }
}
