use crate::error::EvalError;
use crate::formula::{BinOp, Builtin};
use crate::quantity::{Operand, Quantity, Series, Terms};

use super::EvalSettings;

// ---------------------------------------------------------------------------
// First-order propagation on single quantities
// ---------------------------------------------------------------------------

fn finite(q: Quantity, operation: &'static str) -> Result<Quantity, EvalError> {
    if q.value.is_finite() && q.sigma.is_finite() {
        Ok(q)
    } else {
        Err(EvalError::NonFinite { operation })
    }
}

/// `f(x, y)` with partial derivatives `dx`, `dy`.
fn combine(
    settings: &EvalSettings,
    value: f64,
    x: &Quantity,
    dx: f64,
    y: &Quantity,
    dy: f64,
    operation: &'static str,
) -> Result<Quantity, EvalError> {
    let mut variance = dx * dx * x.variance() + dy * dy * y.variance();
    if settings.correlated {
        variance += 2.0 * dx * dy * x.covariance(y);
    }
    let q = Quantity {
        value,
        sigma: variance.max(0.0).sqrt(),
        terms: Terms::combine(&x.terms, dx, &y.terms, dy),
    };
    finite(q, operation)
}

/// Single-operand function with derivative `d`.
fn apply(value: f64, x: &Quantity, d: f64, operation: &'static str) -> Result<Quantity, EvalError> {
    if x.sigma == 0.0 && x.terms.is_empty() {
        return finite(Quantity::exact(value), operation);
    }
    finite(
        Quantity {
            value,
            sigma: (d * x.sigma).abs(),
            terms: x.terms.scale(d),
        },
        operation,
    )
}

fn is_exact(q: &Quantity) -> bool {
    q.sigma == 0.0 && q.terms.is_empty()
}

pub fn binary(
    settings: &EvalSettings,
    op: BinOp,
    a: &Quantity,
    b: &Quantity,
) -> Result<Quantity, EvalError> {
    match op {
        BinOp::Add => combine(settings, a.value + b.value, a, 1.0, b, 1.0, "addition"),
        BinOp::Sub => combine(settings, a.value - b.value, a, 1.0, b, -1.0, "subtraction"),
        BinOp::Mul => combine(settings, a.value * b.value, a, b.value, b, a.value, "multiplication"),
        BinOp::Div => divide(settings, a, b),
        BinOp::Pow => power(settings, a, b),
    }
}

fn divide(settings: &EvalSettings, a: &Quantity, b: &Quantity) -> Result<Quantity, EvalError> {
    if b.value == 0.0 {
        return Err(EvalError::DivisionByZero);
    }
    if settings.check_near_zero && b.value.abs() < settings.near_zero_k * b.sigma {
        return Err(EvalError::NearZeroDivisor {
            value: b.value,
            sigma: b.sigma,
            k: settings.near_zero_k,
        });
    }
    let value = a.value / b.value;
    combine(
        settings,
        value,
        a,
        1.0 / b.value,
        b,
        -value / b.value,
        "division",
    )
}

fn power(settings: &EvalSettings, x: &Quantity, y: &Quantity) -> Result<Quantity, EvalError> {
    let integral = y.value.fract() == 0.0;
    if x.value < 0.0 && !integral {
        return Err(EvalError::Domain {
            function: "pow",
            value: x.value,
        });
    }
    if x.value == 0.0 && y.value < 0.0 {
        return Err(EvalError::DivisionByZero);
    }

    let value = x.value.powf(y.value);
    if is_exact(y) {
        let dx = if y.value == 0.0 {
            0.0
        } else {
            y.value * x.value.powf(y.value - 1.0)
        };
        return apply(value, x, dx, "power");
    }

    // uncertain exponent: ∂/∂y = x^y · ln x
    if x.value <= 0.0 {
        return Err(EvalError::Domain {
            function: "pow",
            value: x.value,
        });
    }
    let dx = y.value * x.value.powf(y.value - 1.0);
    let dy = value * x.value.ln();
    combine(settings, value, x, dx, y, dy, "power")
}

pub fn negate(x: &Quantity) -> Quantity {
    Quantity {
        value: -x.value,
        sigma: x.sigma,
        terms: x.terms.scale(-1.0),
    }
}

/// Element-wise built-ins.
pub fn elementwise(func: Builtin, x: &Quantity) -> Result<Quantity, EvalError> {
    let v = x.value;
    let domain = |function| Err(EvalError::Domain { function, value: v });
    match func {
        Builtin::Sqrt => {
            if v < 0.0 {
                return domain("sqrt");
            }
            let r = v.sqrt();
            apply(r, x, 0.5 / r, "sqrt")
        }
        Builtin::Ln => {
            if v <= 0.0 {
                return domain("ln");
            }
            apply(v.ln(), x, 1.0 / v, "ln")
        }
        Builtin::Log10 => {
            if v <= 0.0 {
                return domain("log10");
            }
            apply(v.log10(), x, 1.0 / (v * std::f64::consts::LN_10), "log10")
        }
        Builtin::Exp => {
            let e = v.exp();
            apply(e, x, e, "exp")
        }
        Builtin::Abs => apply(v.abs(), x, if v < 0.0 { -1.0 } else { 1.0 }, "abs"),
        other => Err(EvalError::Misapplied {
            function: other.name(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Broadcasting over series
// ---------------------------------------------------------------------------

/// Apply `f` element by element. A scalar operand is broadcast; excluded
/// elements stay excluded.
pub fn zip_with<F>(left: Operand, right: Operand, f: F) -> Result<Operand, EvalError>
where
    F: Fn(&Quantity, &Quantity) -> Result<Quantity, EvalError>,
{
    match (left, right) {
        (Operand::Scalar(a), Operand::Scalar(b)) => f(&a, &b).map(Operand::Scalar),
        (Operand::Scalar(a), Operand::Series(s)) => map_series(s, |b| f(&a, b)),
        (Operand::Series(s), Operand::Scalar(b)) => map_series(s, |a| f(a, &b)),
        (Operand::Series(l), Operand::Series(r)) => {
            if l.len() != r.len() {
                return Err(EvalError::LengthMismatch {
                    left: l.len(),
                    right: r.len(),
                });
            }
            let items = l
                .items
                .iter()
                .zip(&r.items)
                .map(|pair| match pair {
                    (Some(a), Some(b)) => f(a, b).map(Some),
                    _ => Ok(None),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Operand::Series(Series::new(l.axis, items)))
        }
    }
}

pub fn map_series<F>(series: Series, f: F) -> Result<Operand, EvalError>
where
    F: Fn(&Quantity) -> Result<Quantity, EvalError>,
{
    let items = series
        .items
        .iter()
        .map(|item| item.as_ref().map(&f).transpose())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Operand::Series(Series::new(series.axis, items)))
}

pub fn map_operand<F>(operand: Operand, f: F) -> Result<Operand, EvalError>
where
    F: Fn(&Quantity) -> Result<Quantity, EvalError>,
{
    match operand {
        Operand::Scalar(q) => f(&q).map(Operand::Scalar),
        Operand::Series(s) => map_series(s, f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::SourceId;

    fn q(value: f64, sigma: f64, src: usize) -> Quantity {
        Quantity::measured(value, sigma, SourceId::Constant(src))
    }

    #[test]
    fn sum_of_square_propagates() {
        let s = EvalSettings::default();
        let x = q(2.0, 0.1, 0);
        let y = q(3.0, 0.2, 1);
        let y2 = binary(&s, BinOp::Pow, &y, &Quantity::exact(2.0)).unwrap();
        let r = binary(&s, BinOp::Add, &x, &y2).unwrap();
        assert_eq!(r.value, 11.0);
        assert!((r.sigma - 1.45f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn near_zero_divisor_is_an_error() {
        let s = EvalSettings::default();
        let a = q(1.0, 0.1, 0);
        let b = q(0.0001, 1.0, 1);
        assert!(matches!(
            binary(&s, BinOp::Div, &a, &b),
            Err(EvalError::NearZeroDivisor { .. })
        ));
        assert_eq!(
            binary(&s, BinOp::Div, &a, &Quantity::exact(0.0)),
            Err(EvalError::DivisionByZero)
        );
    }

    #[test]
    fn correlated_difference_cancels() {
        let x = q(5.0, 0.3, 0);
        let plain = binary(&EvalSettings::default(), BinOp::Sub, &x, &x).unwrap();
        assert!((plain.sigma - 0.3 * 2f64.sqrt()).abs() < 1e-12);

        let s = EvalSettings {
            correlated: true,
            ..EvalSettings::default()
        };
        let r = binary(&s, BinOp::Sub, &x, &x).unwrap();
        assert_eq!(r.value, 0.0);
        assert_eq!(r.sigma, 0.0);
        assert!(r.terms.is_empty());
    }

    #[test]
    fn ratio_relative_errors_add_in_quadrature() {
        let s = EvalSettings::default();
        let r = binary(&s, BinOp::Div, &q(10.0, 0.1, 0), &q(5.0, 0.1, 1)).unwrap();
        let rel = (0.01f64.powi(2) + 0.02f64.powi(2)).sqrt();
        assert!((r.sigma / r.value - rel).abs() < 1e-12);
    }

    #[test]
    fn domain_errors() {
        assert!(matches!(
            elementwise(Builtin::Sqrt, &Quantity::exact(-1.0)),
            Err(EvalError::Domain { function: "sqrt", .. })
        ));
        assert!(matches!(
            elementwise(Builtin::Ln, &Quantity::exact(0.0)),
            Err(EvalError::Domain { function: "ln", .. })
        ));
        assert!(matches!(
            binary(
                &EvalSettings::default(),
                BinOp::Pow,
                &Quantity::exact(-8.0),
                &Quantity::exact(1.0 / 3.0)
            ),
            Err(EvalError::Domain { function: "pow", .. })
        ));
        assert_eq!(
            elementwise(Builtin::Exp, &Quantity::exact(1000.0)),
            Err(EvalError::NonFinite { operation: "exp" })
        );
    }

    #[test]
    fn sqrt_of_exact_zero_is_zero() {
        assert_eq!(
            elementwise(Builtin::Sqrt, &Quantity::exact(0.0)).unwrap(),
            Quantity::exact(0.0)
        );
    }
}
