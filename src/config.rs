use serde::{Deserialize, Serialize};

pub use crate::stats::ErrorPolicy;

// ---------------------------------------------------------------------------
// Session-wide reduction settings
// ---------------------------------------------------------------------------

/// Thresholds and switches shared by every step of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReductionConfig {
    /// A divisor with `|b| < near_zero_k · σb` is rejected.
    pub near_zero_k: f64,
    pub error_policy: ErrorPolicy,
    pub outlier: OutlierConfig,
    pub chauvenet: ChauvenetConfig,
    /// Evaluate independent blocks on scoped worker threads.
    pub parallel_blocks: bool,
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            near_zero_k: 1.0,
            error_policy: ErrorPolicy::default(),
            outlier: OutlierConfig::default(),
            chauvenet: ChauvenetConfig::default(),
            parallel_blocks: false,
        }
    }
}

/// Iterative robust screening (median / scaled MAD).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierConfig {
    /// Rejection threshold in robust standard deviations.
    pub threshold: f64,
    pub max_passes: usize,
    /// Screening stops once fewer values than this remain.
    pub min_count: usize,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        Self {
            threshold: 2.0,
            max_passes: 10,
            min_count: 3,
        }
    }
}

/// Chauvenet's criterion: reject when `n · erfc(|z|) < probability`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChauvenetConfig {
    pub probability: f64,
    pub min_count: usize,
}

impl Default for ChauvenetConfig {
    fn default() -> Self {
        Self {
            probability: 0.5,
            min_count: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-step settings
// ---------------------------------------------------------------------------

/// How a step propagates uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Propagation {
    /// First-order propagation, operands treated as independent.
    #[default]
    Linear,
    /// First-order propagation including covariances between operands.
    LinearCorrelated,
    /// Sampling of all input sources with a fixed seed.
    MonteCarlo { samples: usize, seed: u64 },
}

/// Screening applied to a step's own values across cycles (per-cycle
/// steps) or across blocks (per-block steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenMethod {
    Robust,
    Chauvenet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepConfig {
    pub propagation: Propagation,
    pub screen: Option<ScreenMethod>,
}

impl StepConfig {
    pub fn monte_carlo(samples: usize, seed: u64) -> Self {
        Self {
            propagation: Propagation::MonteCarlo { samples, seed },
            screen: None,
        }
    }

    pub fn correlated() -> Self {
        Self {
            propagation: Propagation::LinearCorrelated,
            screen: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let cfg: ReductionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, ReductionConfig::default());
        assert_eq!(cfg.outlier.threshold, 2.0);
        assert_eq!(cfg.chauvenet.min_count, 20);
    }

    #[test]
    fn propagation_is_tagged() {
        let json = r#"{"propagation":{"mode":"monte_carlo","samples":500,"seed":7},"screen":"robust"}"#;
        let cfg: StepConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.propagation, Propagation::MonteCarlo { samples: 500, seed: 7 });
        assert_eq!(cfg.screen, Some(ScreenMethod::Robust));
        let back = serde_json::to_string(&StepConfig::default()).unwrap();
        assert_eq!(back, r#"{"propagation":{"mode":"linear"},"screen":null}"#);
    }
}
