use std::cell::Cell;

use crate::error::EvalError;
use crate::formula::{BuiltinKind, Cond, Expr};
use crate::quantity::{Operand, Quantity, Series, SourceId};

use super::propagate::{binary, elementwise, map_operand, negate, zip_with};
use super::{Coord, EvalSettings, Scope};

/// Post-order evaluator with first-order uncertainty propagation.
///
/// One evaluator serves one frame. Statistics that report more uncertainty
/// than their inputs explain get a private source named after the frame
/// coordinates and a running sequence number, so repeated runs name their
/// sources identically.
pub struct Evaluator<'s> {
    pub(super) settings: EvalSettings,
    pub(super) coord: Coord,
    pub(super) scope: &'s dyn Scope,
    seq: Cell<u32>,
}

impl<'s> Evaluator<'s> {
    pub fn new(settings: EvalSettings, coord: Coord, scope: &'s dyn Scope) -> Self {
        Self {
            settings,
            coord,
            scope,
            seq: Cell::new(0),
        }
    }

    /// Evaluate to a single value; a series result is an error.
    pub fn scalar(&self, expr: &Expr) -> Result<Quantity, EvalError> {
        match self.eval(expr)? {
            Operand::Scalar(q) => Ok(q),
            Operand::Series(_) => Err(EvalError::SeriesResult),
        }
    }

    pub(super) fn next_source(&self) -> SourceId {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        self.coord.derived(seq)
    }

    pub fn eval(&self, expr: &Expr) -> Result<Operand, EvalError> {
        match expr {
            Expr::Number(v) => Ok(Operand::Scalar(Quantity::exact(*v))),
            Expr::Var(name) => self.scope.operand(name),
            Expr::Neg(inner) => map_operand(self.eval(inner)?, |q| Ok(negate(q))),
            Expr::Binary(op, l, r) => {
                let left = self.eval(l)?;
                let right = self.eval(r)?;
                zip_with(left, right, |a, b| binary(&self.settings, *op, a, b))
            }
            Expr::Call(func, args) => match func.kind() {
                BuiltinKind::Elementwise => {
                    map_operand(self.eval(&args[0])?, |q| elementwise(*func, q))
                }
                BuiltinKind::Time => match &args[0] {
                    Expr::Var(channel) => self.scope.times(channel),
                    _ => Err(EvalError::Misapplied {
                        function: func.name(),
                    }),
                },
                BuiltinKind::Aggregate => {
                    let series = self.series(*func, &args[0])?;
                    self.aggregate(*func, &series).map(Operand::Scalar)
                }
                BuiltinKind::Regression => {
                    let y = self.series(*func, &args[0])?;
                    let x = self.series(*func, &args[1])?;
                    self.regression(*func, &y, &x, None).map(Operand::Scalar)
                }
                BuiltinKind::Prediction => {
                    let y = self.series(*func, &args[0])?;
                    let x = self.series(*func, &args[1])?;
                    let x0 = self.scalar(&args[2])?;
                    self.regression(*func, &y, &x, Some(&x0))
                        .map(Operand::Scalar)
                }
            },
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                if self.condition(cond)? {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
        }
    }

    fn series(&self, func: crate::formula::Builtin, arg: &Expr) -> Result<Series, EvalError> {
        match self.eval(arg)? {
            Operand::Series(s) => Ok(s),
            Operand::Scalar(_) => Err(EvalError::Misapplied {
                function: func.name(),
            }),
        }
    }

    /// Conditions compare nominal values. `and`/`or` short-circuit.
    fn condition(&self, cond: &Cond) -> Result<bool, EvalError> {
        match cond {
            Cond::Compare(op, l, r) => {
                let a = self.scalar(l)?;
                let b = self.scalar(r)?;
                Ok(op.holds(a.value, b.value))
            }
            Cond::And(l, r) => Ok(self.condition(l)? && self.condition(r)?),
            Cond::Or(l, r) => Ok(self.condition(l)? || self.condition(r)?),
            Cond::Not(inner) => Ok(!self.condition(inner)?),
        }
    }
}
