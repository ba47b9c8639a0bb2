//! Isotope-ratio data reduction.
//!
//! Raw multi-collector intensities are reduced to ratios with propagated
//! uncertainties through a user-authored sequence of named formulas.
//!
//! ```text
//!  formula text ──► formula::parse ──► Expr
//!                                        │
//!  blocks (data::loader) ──► Session ────┤ validate: names, shapes, graph
//!                                        ▼
//!                                 reduce::run  (staged: blocks, then session)
//!                                        │
//!                                        ▼
//!                               RunReport / EvaluationResult
//! ```

pub mod config;
pub mod data;
pub mod error;
pub mod eval;
pub mod formula;
pub mod graph;
pub mod quantity;
pub mod reduce;
pub mod result;
pub mod session;
pub mod stats;
pub mod step;

pub use config::{Propagation, ReductionConfig, ScreenMethod, StepConfig};
pub use data::model::{Block, Constant, RawChannel, Sample};
pub use error::{
    BlockEvalError, CycleError, DefinitionError, EvalError, ReduceError, SessionEvalError,
    ShapeError, SyntaxError,
};
pub use result::{Estimate, EvaluationResult, Measurement, Provenance, RunReport};
pub use session::{CancelFlag, Session, SessionState};
pub use step::{OutputShape, StepDefinition};
