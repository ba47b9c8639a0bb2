use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{BlockEvalError, SessionEvalError};
use crate::quantity::Quantity;
use crate::reduce::BlockResults;
use crate::step::OutputShape;

// ---------------------------------------------------------------------------
// Exported results
// ---------------------------------------------------------------------------

/// Where a result was computed. Blocks are identified by their number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Provenance {
    Cycle { block: usize, cycle: usize },
    Block { block: usize },
    Session,
}

/// A value with its one-sigma uncertainty. `included` is false when the
/// element was screened out or belongs to a user-rejected block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub value: f64,
    pub sigma: f64,
    pub included: bool,
}

impl Measurement {
    fn of(q: &Quantity, included: bool) -> Self {
        Self {
            value: q.value,
            sigma: q.sigma,
            included,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimate {
    Scalar(Measurement),
    /// Indexed by cycle position or by block position. `None` marks an
    /// element with no value: a user-rejected cycle or a failed block.
    Vector(Vec<Option<Measurement>>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationResult {
    pub step: String,
    pub provenance: Provenance,
    pub estimate: Estimate,
}

// ---------------------------------------------------------------------------
// RunReport – everything one run produced
// ---------------------------------------------------------------------------

/// Results of a completed run. Failed blocks hold no values.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub steps: Vec<(String, OutputShape)>,
    /// Evaluation order, by name.
    pub order: Vec<String>,
    pub block_numbers: Vec<usize>,
    pub block_rejected: Vec<bool>,
    pub blocks: Vec<BlockResults>,
    pub scalars: BTreeMap<usize, Quantity>,
    pub block_errors: Vec<BlockEvalError>,
    pub session_errors: Vec<SessionEvalError>,
}

impl RunReport {
    fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|(n, _)| n == name)
    }

    fn block_index(&self, number: usize) -> Option<usize> {
        self.block_numbers.iter().position(|&n| n == number)
    }

    pub fn is_clean(&self) -> bool {
        self.block_errors.is_empty() && self.session_errors.is_empty()
    }

    /// Look up one result.
    ///
    /// * scalar step: no block, no cycle
    /// * per-block step: a block for its value, no block for the vector
    ///   over all blocks
    /// * per-cycle step: block and cycle for one value, a block alone for
    ///   the vector over its cycles
    pub fn result(
        &self,
        step: &str,
        block: Option<usize>,
        cycle: Option<usize>,
    ) -> Option<EvaluationResult> {
        let s = self.step_index(step)?;
        let (name, shape) = &self.steps[s];
        let (provenance, estimate) = match (shape, block, cycle) {
            (OutputShape::Scalar, None, None) => (
                Provenance::Session,
                Estimate::Scalar(Measurement::of(self.scalars.get(&s)?, true)),
            ),
            (OutputShape::PerBlock, Some(number), None) => {
                let b = self.block_index(number)?;
                (
                    Provenance::Block { block: number },
                    Estimate::Scalar(self.block_value(s, b)?),
                )
            }
            (OutputShape::PerBlock, None, None) => (
                Provenance::Session,
                Estimate::Vector(
                    (0..self.blocks.len())
                        .map(|b| self.block_value(s, b))
                        .collect(),
                ),
            ),
            (OutputShape::PerCycle, Some(number), Some(c)) => {
                let b = self.block_index(number)?;
                let cv = self.blocks[b].cycles.get(&s)?;
                let q = cv.values.get(c)?.as_ref()?;
                let included = cv.included.get(c).copied().unwrap_or(false) && !self.block_rejected[b];
                (
                    Provenance::Cycle {
                        block: number,
                        cycle: c,
                    },
                    Estimate::Scalar(Measurement::of(q, included)),
                )
            }
            (OutputShape::PerCycle, Some(number), None) => {
                let b = self.block_index(number)?;
                let cv = self.blocks[b].cycles.get(&s)?;
                let rejected = self.block_rejected[b];
                let items = cv
                    .values
                    .iter()
                    .zip(&cv.included)
                    .map(|(q, &inc)| q.as_ref().map(|q| Measurement::of(q, inc && !rejected)))
                    .collect();
                (Provenance::Block { block: number }, Estimate::Vector(items))
            }
            _ => return None,
        };
        Some(EvaluationResult {
            step: name.clone(),
            provenance,
            estimate,
        })
    }

    fn block_value(&self, step: usize, b: usize) -> Option<Measurement> {
        let r = &self.blocks[b];
        let q = r.values.get(&step)?;
        let included = !self.block_rejected[b] && !r.screened_out.contains(&step);
        Some(Measurement::of(q, included))
    }

    /// Every available result, in evaluation order: one per scalar step,
    /// one per block for per-block steps, one vector per block for
    /// per-cycle steps.
    pub fn results(&self) -> Vec<EvaluationResult> {
        let mut out = Vec::new();
        for name in &self.order {
            let Some(s) = self.step_index(name) else {
                continue;
            };
            match self.steps[s].1 {
                OutputShape::Scalar => out.extend(self.result(name, None, None)),
                OutputShape::PerBlock | OutputShape::PerCycle => {
                    for &number in &self.block_numbers {
                        out.extend(self.result(name, Some(number), None));
                    }
                }
            }
        }
        out
    }
}
