//! Weighted overall score
//!
//! Each signal contributes `score * weight`; the total is divided by the sum of the
//! weights that actually contributed, so missing analyses do not drag the score down.

use crate::types::round2;

pub const COMPATIBILITY_WEIGHT: f64 = 0.40;
pub const ACCESSIBILITY_WEIGHT: f64 = 0.25;
pub const PERFORMANCE_WEIGHT: f64 = 0.20;
pub const DELIVERABILITY_WEIGHT: f64 = 0.15;

/// Running `(score * weight, weight)` sums
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreAccumulator {
    weighted: f64,
    weight: f64,
}

impl ScoreAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a 0-100 signal; `None` contributes nothing
    pub fn add(&mut self, score: Option<f64>, weight: f64) -> &mut Self {
        if let Some(score) = score {
            self.weighted += score * weight;
            self.weight += weight;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.weight == 0.0
    }

    /// Re-normalized score rounded to two decimals, 0 with no signals
    pub fn finish(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        round2((self.weighted / self.weight).clamp(0.0, 100.0))
    }
}

/// Qualitative bucket for an overall score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl CompatibilityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 90.0 {
            Self::Excellent
        } else if score >= 75.0 {
            Self::Good
        } else if score >= 60.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

impl std::fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompatibilityLevel::Excellent => write!(f, "excellent"),
            CompatibilityLevel::Good => write!(f, "good"),
            CompatibilityLevel::Fair => write!(f, "fair"),
            CompatibilityLevel::Poor => write!(f, "poor"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_signal_is_renormalized() {
        let mut acc = ScoreAccumulator::new();
        acc.add(None, COMPATIBILITY_WEIGHT)
            .add(Some(80.0), ACCESSIBILITY_WEIGHT);
        assert_eq!(acc.finish(), 80.0);
    }

    #[test]
    fn test_all_signals() {
        let mut acc = ScoreAccumulator::new();
        acc.add(Some(90.0), COMPATIBILITY_WEIGHT)
            .add(Some(80.0), ACCESSIBILITY_WEIGHT)
            .add(Some(70.0), PERFORMANCE_WEIGHT)
            .add(Some(60.0), DELIVERABILITY_WEIGHT);
        // 36 + 20 + 14 + 9
        assert_eq!(acc.finish(), 79.0);
    }

    #[test]
    fn test_empty_is_zero() {
        let acc = ScoreAccumulator::new();
        assert!(acc.is_empty());
        assert_eq!(acc.finish(), 0.0);
    }

    #[test]
    fn test_levels() {
        assert_eq!(CompatibilityLevel::from_score(90.0), CompatibilityLevel::Excellent);
        assert_eq!(CompatibilityLevel::from_score(89.99), CompatibilityLevel::Good);
        assert_eq!(CompatibilityLevel::from_score(75.0), CompatibilityLevel::Good);
        assert_eq!(CompatibilityLevel::from_score(60.0), CompatibilityLevel::Fair);
        assert_eq!(CompatibilityLevel::from_score(59.0), CompatibilityLevel::Poor);
    }
}
