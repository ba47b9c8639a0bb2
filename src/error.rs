use thiserror::Error;

use crate::quantity::Axis;
use crate::stats::KernelError;

// ---------------------------------------------------------------------------
// Structural errors – detected before any data is touched
// ---------------------------------------------------------------------------

/// Malformed formula text. `position` is the byte offset of the offending token.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("syntax error at offset {position}: {message}")]
pub struct SyntaxError {
    pub position: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

/// Operand or output shape mismatch found by the static shape check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("expression yields a {found} but the step must produce one value per {frame}")]
    NotScalar { found: String, frame: &'static str },

    #[error("cannot combine a {left} series with a {right} series")]
    AxisMismatch { left: Axis, right: Axis },

    #[error("{function}() needs a series argument, got a scalar")]
    NeedsSeries { function: &'static str },

    #[error("{function}() argument {argument} must be a scalar")]
    NeedsScalar {
        function: &'static str,
        argument: usize,
    },

    #[error("{function}() aggregates across cycles and cannot be used in a per-cycle step")]
    AggregateInCycleStep { function: &'static str },

    #[error("if-conditions must compare scalar values")]
    SeriesCondition,

    #[error("if-branches disagree: then-branch is a {then}, else-branch is a {otherwise}")]
    BranchMismatch { then: String, otherwise: String },

    #[error("time() expects a raw channel name, '{name}' is not one")]
    TimeNeedsChannel { name: String },

    #[error("per-cycle step '{step}' reads per-block step '{aggregate}', which aggregates '{step}' itself")]
    ForwardLeakage { step: String, aggregate: String },
}

/// Circular dependency between steps. `path` starts and ends with the same name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circular step dependency: {}", .path.join(" -> "))]
pub struct CycleError {
    pub path: Vec<String>,
}

/// Why a step (or the step set) failed validation. Nothing is registered on failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DefinitionError {
    #[error("step '{step}': {source}")]
    Syntax {
        step: String,
        #[source]
        source: SyntaxError,
    },

    #[error("step '{step}': {source}")]
    Shape {
        step: String,
        #[source]
        source: ShapeError,
    },

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error("name '{name}' is already used by a {existing}")]
    NameCollision { name: String, existing: &'static str },

    #[error("step '{step}' references unknown name '{name}'")]
    UnknownName { step: String, name: String },

    #[error("no step named '{0}'")]
    UnknownStep(String),

    #[error("no constant named '{0}'")]
    UnknownConstant(String),

    #[error("no block {block}{}", .cycle.map(|c| format!(" with cycle {c}")).unwrap_or_default())]
    UnknownBlock { block: usize, cycle: Option<usize> },

    #[error("block number {0} appears more than once")]
    DuplicateBlock(usize),

    #[error("block {block}, channel '{channel}': {message}")]
    MalformedBlock {
        block: usize,
        channel: String,
        message: String,
    },

    #[error("'{name}' is still referenced by step '{by}'")]
    StillReferenced { name: String, by: String },

    #[error("step '{step}': invalid configuration: {message}")]
    Config { step: String, message: String },
}

// ---------------------------------------------------------------------------
// Runtime errors – attributable to a (step, block, cycle) coordinate
// ---------------------------------------------------------------------------

/// Numeric fault raised while evaluating one step in one frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("divisor {value} is indistinguishable from zero (sigma {sigma}, k = {k})")]
    NearZeroDivisor { value: f64, sigma: f64, k: f64 },

    #[error("division by zero")]
    DivisionByZero,

    #[error("{function}({value}) is outside the function's domain")]
    Domain { function: &'static str, value: f64 },

    #[error("'{0}' is not available in this block")]
    UnresolvedName(String),

    #[error("'{0}' has no value because its own evaluation failed")]
    DependencyFailed(String),

    #[error("{function}(): no included values to aggregate")]
    EmptySeries { function: &'static str },

    #[error("{function}(): {source}")]
    Kernel {
        function: &'static str,
        #[source]
        source: KernelError,
    },

    #[error("series lengths differ ({left} vs {right})")]
    LengthMismatch { left: usize, right: usize },

    #[error("{operation} produced a non-finite result")]
    NonFinite { operation: &'static str },

    #[error("expression produced a series where a single value was expected")]
    SeriesResult,

    #[error("{function}() cannot be applied to this operand")]
    Misapplied { function: &'static str },

    #[error("Monte Carlo sample {sample}: {source}")]
    MonteCarlo {
        sample: usize,
        #[source]
        source: Box<EvalError>,
    },
}

/// One block's evaluation failed; other blocks are unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("block {block}, step '{step}'{}: {error}", .cycle.map(|c| format!(", cycle {c}")).unwrap_or_default())]
pub struct BlockEvalError {
    pub block: usize,
    pub step: String,
    pub cycle: Option<usize>,
    pub error: EvalError,
}

/// A session-level (scalar) step failed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("session step '{step}': {error}")]
pub struct SessionEvalError {
    pub step: String,
    pub error: EvalError,
}

/// Why a whole run did not produce a report.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReduceError {
    #[error("session definition is invalid: {0}")]
    Definition(#[from] DefinitionError),

    #[error("run cancelled")]
    Cancelled,
}
