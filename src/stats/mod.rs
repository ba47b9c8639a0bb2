//! Statistics kernels. Pure functions over plain `f64` slices; the evaluator
//! maps their results back onto quantities with uncertainty decompositions.

use thiserror::Error;

pub mod descriptive;
pub mod outlier;
pub mod regression;
pub mod sampling;
pub mod weighted;

pub use descriptive::{describe, geometric_mean, median, Describe, GeometricMean};
pub use outlier::{chauvenet_screen, robust_screen, Screening};
pub use regression::{ordinary_fit, weighted_fit, LineFit};
pub use sampling::{frame_seed, NormalSampler};
pub use weighted::{weighted_mean, ErrorPolicy, WeightedMean};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error("needs at least {needed} values, got {got}")]
    InsufficientData { needed: usize, got: usize },

    #[error("uncertainty {sigma} at position {index} cannot be used as a weight")]
    ZeroWeight { index: usize, sigma: f64 },

    #[error("x values have no spread, the line is undefined")]
    Degenerate,

    #[error("value {value} at position {index} is not strictly positive")]
    NonPositive { index: usize, value: f64 },
}

pub(crate) fn require(needed: usize, got: usize) -> Result<(), KernelError> {
    if got < needed {
        Err(KernelError::InsufficientData { needed, got })
    } else {
        Ok(())
    }
}
