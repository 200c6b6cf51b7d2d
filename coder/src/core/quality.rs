//! Code quality scoring for the improvement loop.

use serde::{Deserialize, Serialize};

pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.85;

/// Metrics reported by the model, each in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityMetrics {
    pub code_quality: f64,
    pub test_coverage: f64,
    pub performance: f64,
    pub modularity: f64,
    pub documentation: f64,
}

impl QualityMetrics {
    /// Clamp every metric into `0.0..=1.0`; non-finite values become 0.
    pub fn clamped(self) -> Self {
        let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            code_quality: clamp(self.code_quality),
            test_coverage: clamp(self.test_coverage),
            performance: clamp(self.performance),
            modularity: clamp(self.modularity),
            documentation: clamp(self.documentation),
        }
    }

    /// Weighted score: quality 0.3, coverage/performance/modularity 0.2 each,
    /// documentation 0.1.
    pub fn score(&self) -> f64 {
        let m = self.clamped();
        0.3 * m.code_quality
            + 0.2 * m.test_coverage
            + 0.2 * m.performance
            + 0.2 * m.modularity
            + 0.1 * m.documentation
    }

    pub fn needs_improvement(&self, threshold: f64) -> bool {
        self.score() < threshold
    }
}

/// Persisted record of one improvement loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementRecord {
    pub path: String,
    pub initial: QualityMetrics,
    pub last: QualityMetrics,
    pub rounds: u32,
    pub plans: Vec<String>,
}

impl ImprovementRecord {
    pub fn improvement(&self) -> f64 {
        self.last.score() - self.initial.score()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_score_matches_weights() {
        let metrics = QualityMetrics {
            code_quality: 1.0,
            test_coverage: 0.5,
            performance: 0.5,
            modularity: 0.5,
            documentation: 0.0,
        };
        assert!((metrics.score() - 0.6).abs() < 1e-9);
        assert!(metrics.needs_improvement(DEFAULT_QUALITY_THRESHOLD));
    }

    #[test]
    fn out_of_range_metrics_are_clamped() {
        let metrics = QualityMetrics {
            code_quality: 3.0,
            test_coverage: f64::NAN,
            performance: 1.0,
            modularity: 1.0,
            documentation: -1.0,
        };
        assert!((metrics.score() - 0.7).abs() < 1e-9);
    }
}
