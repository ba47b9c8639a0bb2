use std::collections::BTreeMap;
use std::fmt;

use crate::data::context::Symbol;
use crate::error::ShapeError;
use crate::formula::{BuiltinKind, Cond, Expr};
use crate::graph::DependencyGraph;
use crate::quantity::Axis;
use crate::step::OutputShape;

/// Static shape of an expression in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Series(Axis),
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Scalar => f.write_str("scalar"),
            Shape::Series(axis) => write!(f, "{axis} series"),
        }
    }
}

/// The frame a step is evaluated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Cycle,
    Block,
    Session,
}

impl FrameKind {
    pub fn of(shape: OutputShape) -> Self {
        match shape {
            OutputShape::PerCycle => FrameKind::Cycle,
            OutputShape::PerBlock => FrameKind::Block,
            OutputShape::Scalar => FrameKind::Session,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Cycle => "cycle",
            FrameKind::Block => "block",
            FrameKind::Session => "session",
        }
    }
}

/// Shape a reference takes in a frame.
pub fn reference_shape(symbol: Symbol, step_shapes: &[OutputShape], frame: FrameKind) -> Shape {
    let per_cycle = match frame {
        FrameKind::Cycle => Shape::Scalar,
        FrameKind::Block | FrameKind::Session => Shape::Series(Axis::Cycles),
    };
    match symbol {
        Symbol::Constant(_) | Symbol::NotFound => Shape::Scalar,
        Symbol::RawChannel(_) => per_cycle,
        Symbol::Step(i) => match step_shapes.get(i) {
            Some(OutputShape::PerCycle) => per_cycle,
            Some(OutputShape::PerBlock) if frame == FrameKind::Session => {
                Shape::Series(Axis::Blocks)
            }
            _ => Shape::Scalar,
        },
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

struct Checker<'a> {
    bindings: &'a BTreeMap<String, Symbol>,
    step_shapes: &'a [OutputShape],
    frame: FrameKind,
}

impl Checker<'_> {
    fn lookup(&self, name: &str) -> Symbol {
        self.bindings.get(name).copied().unwrap_or(Symbol::NotFound)
    }

    fn infer(&self, expr: &Expr) -> Result<Shape, ShapeError> {
        match expr {
            Expr::Number(_) => Ok(Shape::Scalar),
            Expr::Var(name) => Ok(reference_shape(self.lookup(name), self.step_shapes, self.frame)),
            Expr::Neg(inner) => self.infer(inner),
            Expr::Binary(_, l, r) => broadcast(self.infer(l)?, self.infer(r)?),
            Expr::Call(func, args) => {
                let name = func.name();
                match func.kind() {
                    BuiltinKind::Elementwise => self.infer(&args[0]),
                    BuiltinKind::Time => match &args[0] {
                        Expr::Var(channel) => match self.lookup(channel) {
                            sym @ Symbol::RawChannel(_) => {
                                Ok(reference_shape(sym, self.step_shapes, self.frame))
                            }
                            _ => Err(ShapeError::TimeNeedsChannel {
                                name: channel.clone(),
                            }),
                        },
                        other => Err(ShapeError::TimeNeedsChannel {
                            name: other.to_string(),
                        }),
                    },
                    BuiltinKind::Aggregate => {
                        self.forbid_in_cycle(name)?;
                        self.series_arg(name, &args[0])?;
                        Ok(Shape::Scalar)
                    }
                    BuiltinKind::Regression | BuiltinKind::Prediction => {
                        self.forbid_in_cycle(name)?;
                        let y = self.series_arg(name, &args[0])?;
                        let x = self.series_arg(name, &args[1])?;
                        if x != y {
                            return Err(ShapeError::AxisMismatch { left: y, right: x });
                        }
                        if let Some(x0) = args.get(2) {
                            if self.infer(x0)? != Shape::Scalar {
                                return Err(ShapeError::NeedsScalar {
                                    function: name,
                                    argument: 3,
                                });
                            }
                        }
                        Ok(Shape::Scalar)
                    }
                }
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                self.check_cond(cond)?;
                let a = self.infer(then)?;
                let b = self.infer(otherwise)?;
                if a != b {
                    return Err(ShapeError::BranchMismatch {
                        then: a.to_string(),
                        otherwise: b.to_string(),
                    });
                }
                Ok(a)
            }
        }
    }

    fn forbid_in_cycle(&self, function: &'static str) -> Result<(), ShapeError> {
        if self.frame == FrameKind::Cycle {
            Err(ShapeError::AggregateInCycleStep { function })
        } else {
            Ok(())
        }
    }

    fn series_arg(&self, function: &'static str, arg: &Expr) -> Result<Axis, ShapeError> {
        match self.infer(arg)? {
            Shape::Series(axis) => Ok(axis),
            Shape::Scalar => Err(ShapeError::NeedsSeries { function }),
        }
    }

    fn check_cond(&self, cond: &Cond) -> Result<(), ShapeError> {
        match cond {
            Cond::Compare(_, l, r) => {
                if self.infer(l)? != Shape::Scalar || self.infer(r)? != Shape::Scalar {
                    return Err(ShapeError::SeriesCondition);
                }
                Ok(())
            }
            Cond::And(l, r) | Cond::Or(l, r) => {
                self.check_cond(l)?;
                self.check_cond(r)
            }
            Cond::Not(inner) => self.check_cond(inner),
        }
    }
}

fn broadcast(a: Shape, b: Shape) -> Result<Shape, ShapeError> {
    match (a, b) {
        (Shape::Scalar, s) | (s, Shape::Scalar) => Ok(s),
        (Shape::Series(l), Shape::Series(r)) if l == r => Ok(a),
        (Shape::Series(left), Shape::Series(right)) => Err(ShapeError::AxisMismatch { left, right }),
    }
}

/// Shape of `expr` evaluated in `frame`.
pub fn infer(
    expr: &Expr,
    bindings: &BTreeMap<String, Symbol>,
    step_shapes: &[OutputShape],
    frame: FrameKind,
) -> Result<Shape, ShapeError> {
    Checker {
        bindings,
        step_shapes,
        frame,
    }
    .infer(expr)
}

/// A step's expression must reduce to one value in its own frame.
pub fn check_step(
    expr: &Expr,
    shape: OutputShape,
    bindings: &BTreeMap<String, Symbol>,
    step_shapes: &[OutputShape],
) -> Result<(), ShapeError> {
    let frame = FrameKind::of(shape);
    match infer(expr, bindings, step_shapes, frame)? {
        Shape::Scalar => Ok(()),
        found => Err(ShapeError::NotScalar {
            found: found.to_string(),
            frame: frame.name(),
        }),
    }
}

/// A per-cycle step may not read a per-block step that is itself computed
/// from the per-cycle step. Returns the offending `(step, aggregate)` pair.
pub fn check_leakage(
    graph: &DependencyGraph,
    step_shapes: &[OutputShape],
) -> Result<(), ShapeError> {
    for (p, shape) in step_shapes.iter().enumerate() {
        if *shape != OutputShape::PerCycle {
            continue;
        }
        for &q in graph.dependencies(p) {
            if step_shapes.get(q) == Some(&OutputShape::PerBlock) && graph.reaches(q, p) {
                return Err(ShapeError::ForwardLeakage {
                    step: graph.name(p).to_string(),
                    aggregate: graph.name(q).to_string(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::parse;

    fn bindings(pairs: &[(&str, Symbol)]) -> BTreeMap<String, Symbol> {
        pairs.iter().map(|(n, s)| (n.to_string(), *s)).collect()
    }

    fn check(text: &str, shape: OutputShape) -> Result<(), ShapeError> {
        let b = bindings(&[
            ("Pb206", Symbol::RawChannel(0)),
            ("Pb204", Symbol::RawChannel(1)),
            ("k", Symbol::Constant(0)),
            ("r", Symbol::Step(0)),
            ("mr", Symbol::Step(1)),
        ]);
        let shapes = [OutputShape::PerCycle, OutputShape::PerBlock];
        check_step(&parse(text).unwrap(), shape, &b, &shapes)
    }

    #[test]
    fn cycle_steps_see_scalars() {
        assert_eq!(check("Pb206 / Pb204 * k", OutputShape::PerCycle), Ok(()));
        assert_eq!(check("r - mr", OutputShape::PerCycle), Ok(()));
        assert_eq!(
            check("mean(r)", OutputShape::PerCycle),
            Err(ShapeError::AggregateInCycleStep { function: "mean" })
        );
    }

    #[test]
    fn block_steps_must_aggregate() {
        assert_eq!(check("wmean(r)", OutputShape::PerBlock), Ok(()));
        assert_eq!(
            check("r * 2", OutputShape::PerBlock),
            Err(ShapeError::NotScalar {
                found: "per-cycle series".into(),
                frame: "block"
            })
        );
        assert_eq!(
            check("slope(r, time(Pb206))", OutputShape::PerBlock),
            Ok(())
        );
        assert_eq!(
            check("mean(k)", OutputShape::PerBlock),
            Err(ShapeError::NeedsSeries { function: "mean" })
        );
    }

    #[test]
    fn session_steps_see_block_series() {
        assert_eq!(check("wmean(mr)", OutputShape::Scalar), Ok(()));
        assert_eq!(
            check("mean(mr - r)", OutputShape::Scalar),
            Err(ShapeError::AxisMismatch {
                left: Axis::Blocks,
                right: Axis::Cycles
            })
        );
        assert_eq!(
            check("predict(mr, mr, r)", OutputShape::Scalar),
            Err(ShapeError::NeedsScalar {
                function: "predict",
                argument: 3
            })
        );
    }

    #[test]
    fn conditions_and_branches() {
        assert_eq!(
            check("if k > 0 then r else 0", OutputShape::PerCycle),
            Ok(())
        );
        assert_eq!(
            check("if r > 0 then mean(r) else 0", OutputShape::PerBlock),
            Err(ShapeError::SeriesCondition)
        );
        assert!(matches!(
            check("mean(if k > 0 then r else 0)", OutputShape::PerBlock),
            Err(ShapeError::BranchMismatch { .. })
        ));
    }

    #[test]
    fn time_requires_raw_channel() {
        assert_eq!(
            check("slope(r, time(r))", OutputShape::PerBlock),
            Err(ShapeError::TimeNeedsChannel { name: "r".into() })
        );
    }
}
