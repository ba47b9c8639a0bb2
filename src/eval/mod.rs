//! Evaluation of compiled formulas against a bound data frame.
//!
//! ```text
//!  Expr ──► shape::check_step   (static, before any data)
//!   │
//!   ▼
//!  evaluate_step ──► Linear / LinearCorrelated ──► linear::Evaluator
//!                └─► MonteCarlo                ──► montecarlo::evaluate
//! ```

pub mod functions;
pub mod linear;
pub mod montecarlo;
pub mod propagate;
pub mod shape;

use crate::config::{ChauvenetConfig, OutlierConfig, Propagation, ReductionConfig, StepConfig};
use crate::error::EvalError;
use crate::formula::Expr;
use crate::quantity::{Operand, Quantity, SourceId};
use crate::stats::ErrorPolicy;

pub use linear::Evaluator;
pub use shape::{FrameKind, Shape};

/// Name lookup for one evaluation frame.
pub trait Scope {
    /// Value bound to `name` in this frame: a raw channel, constant or the
    /// result of an earlier step.
    fn operand(&self, name: &str) -> Result<Operand, EvalError>;

    /// Sample times of a raw channel, as exact values.
    fn times(&self, channel: &str) -> Result<Operand, EvalError>;
}

/// Frame coordinates of one evaluation. Seeds Monte Carlo streams and names
/// the private uncertainty sources a step introduces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coord {
    pub step: usize,
    pub block: Option<usize>,
    pub cycle: Option<usize>,
}

impl Coord {
    pub fn derived(&self, seq: u32) -> SourceId {
        SourceId::Derived {
            step: self.step,
            block: self.block,
            cycle: self.cycle,
            seq,
        }
    }
}

/// Numeric settings threaded through one step's evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalSettings {
    pub near_zero_k: f64,
    /// Off while evaluating Monte Carlo draws, where each draw is exact.
    pub check_near_zero: bool,
    pub correlated: bool,
    pub error_policy: ErrorPolicy,
    pub outlier: OutlierConfig,
    pub chauvenet: ChauvenetConfig,
}

impl EvalSettings {
    pub fn for_step(config: &ReductionConfig, step: &StepConfig) -> Self {
        Self {
            near_zero_k: config.near_zero_k,
            check_near_zero: true,
            correlated: matches!(step.propagation, Propagation::LinearCorrelated),
            error_policy: config.error_policy,
            outlier: config.outlier,
            chauvenet: config.chauvenet,
        }
    }
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self::for_step(&ReductionConfig::default(), &StepConfig::default())
    }
}

/// Evaluate a step's expression to its single value in the given frame,
/// using the step's propagation mode.
pub fn evaluate_step(
    expr: &Expr,
    propagation: Propagation,
    settings: EvalSettings,
    coord: Coord,
    scope: &dyn Scope,
) -> Result<Quantity, EvalError> {
    match propagation {
        Propagation::Linear | Propagation::LinearCorrelated => {
            Evaluator::new(settings, coord, scope).scalar(expr)
        }
        Propagation::MonteCarlo { samples, seed } => {
            montecarlo::evaluate(expr, samples, seed, settings, coord, scope)
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;

    use super::*;
    use crate::quantity::{Axis, Series};

    /// Scope over a fixed name → operand table.
    #[derive(Default)]
    pub struct MapScope {
        pub values: HashMap<String, Operand>,
        pub times: HashMap<String, Operand>,
    }

    impl MapScope {
        pub fn scalar(mut self, name: &str, value: f64, sigma: f64, source: usize) -> Self {
            let q = Quantity::measured(value, sigma, SourceId::Constant(source));
            self.values.insert(name.to_string(), Operand::Scalar(q));
            self
        }

        /// Cycle series with one independent source per element.
        pub fn series(mut self, name: &str, values: &[(f64, f64)], channel: usize) -> Self {
            let items = values
                .iter()
                .enumerate()
                .map(|(cycle, &(v, s))| {
                    Some(Quantity::measured(
                        v,
                        s,
                        SourceId::Sample {
                            block: 0,
                            channel,
                            cycle,
                        },
                    ))
                })
                .collect();
            self.values
                .insert(name.to_string(), Operand::Series(Series::new(Axis::Cycles, items)));
            self
        }
    }

    impl Scope for MapScope {
        fn operand(&self, name: &str) -> Result<Operand, EvalError> {
            self.values
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UnresolvedName(name.to_string()))
        }

        fn times(&self, channel: &str) -> Result<Operand, EvalError> {
            self.times
                .get(channel)
                .cloned()
                .ok_or_else(|| EvalError::UnresolvedName(channel.to_string()))
        }
    }

    pub const COORD: Coord = Coord {
        step: 0,
        block: Some(0),
        cycle: None,
    };
}
