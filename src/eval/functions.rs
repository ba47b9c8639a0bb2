use crate::error::EvalError;
use crate::formula::Builtin;
use crate::quantity::{Quantity, Series, Terms};
use crate::stats::{self, KernelError};

use super::Evaluator;

// ---------------------------------------------------------------------------
// Aggregates and fits: series in, one quantity out
// ---------------------------------------------------------------------------

impl Evaluator<'_> {
    /// Wrap a kernel result: attach any variance the linear decomposition
    /// misses as a private source, and refuse non-finite output.
    fn finish(
        &self,
        function: &'static str,
        value: f64,
        sigma: f64,
        terms: Terms,
    ) -> Result<Quantity, EvalError> {
        if !value.is_finite() || !sigma.is_finite() {
            return Err(EvalError::NonFinite {
                operation: function,
            });
        }
        let q = Quantity {
            value,
            sigma,
            terms,
        };
        Ok(q.with_residual(self.next_source()))
    }

    /// Variance of `Σ c_i q_i` under the step's correlation setting.
    fn combination_variance(&self, items: &[&Quantity], coefs: &[f64], terms: &Terms) -> f64 {
        let independent: f64 = items
            .iter()
            .zip(coefs)
            .map(|(q, c)| c * c * q.variance())
            .sum();
        if !self.settings.correlated {
            return independent;
        }
        let own: f64 = items
            .iter()
            .zip(coefs)
            .map(|(q, c)| c * c * q.terms.norm_sq())
            .sum();
        (independent + terms.norm_sq() - own).max(0.0)
    }

    pub(super) fn aggregate(&self, func: Builtin, series: &Series) -> Result<Quantity, EvalError> {
        let name = func.name();
        let items: Vec<&Quantity> = series.included().map(|(_, q)| q).collect();
        if func == Builtin::Count {
            return Ok(Quantity::exact(items.len() as f64));
        }
        if items.is_empty() {
            return Err(EvalError::EmptySeries { function: name });
        }

        match func {
            Builtin::Sum => {
                let coefs = vec![1.0; items.len()];
                let terms = linear_terms(&items, &coefs);
                let variance = self.combination_variance(&items, &coefs, &terms);
                let value = items.iter().map(|q| q.value).sum();
                self.finish(name, value, variance.sqrt(), terms)
            }
            Builtin::Mean => self.scatter_mean(name, &items),
            Builtin::WMean => self.weighted_mean(name, &items),
            Builtin::StDev | Builtin::StErr => {
                let values = nominal(&items);
                let d = stats::describe(&values).map_err(kernel(name))?;
                let dof = (d.n - 1) as f64;
                let scale = if func == Builtin::StErr {
                    1.0 / (d.n as f64).sqrt()
                } else {
                    1.0
                };
                let coefs: Vec<f64> = values
                    .iter()
                    .map(|x| {
                        if d.std_dev > 0.0 {
                            scale * (x - d.mean) / (dof * d.std_dev)
                        } else {
                            0.0
                        }
                    })
                    .collect();
                let value = scale * d.std_dev;
                let sigma = value / (2.0 * dof).sqrt();
                self.finish(name, value, sigma, linear_terms(&items, &coefs))
            }
            Builtin::Mswd => {
                let wm = stats::weighted_mean(&nominal(&items), &sigmas(&items))
                    .map_err(kernel(name))?;
                let mswd = wm.mswd.ok_or(EvalError::Kernel {
                    function: name,
                    source: KernelError::InsufficientData { needed: 2, got: 1 },
                })?;
                let sigma = (2.0 / (wm.n - 1) as f64).sqrt();
                self.finish(name, mswd, sigma, Terms::none())
            }
            Builtin::FilteredMean | Builtin::FilteredWMean => {
                let values = nominal(&items);
                let screen =
                    stats::robust_screen(&values, &vec![true; values.len()], &self.settings.outlier);
                log::debug!(
                    "{name}: {} of {} values rejected in {} passes",
                    screen.rejected,
                    values.len(),
                    screen.passes
                );
                let kept = keep(&items, &screen.included);
                if func == Builtin::FilteredMean {
                    self.scatter_mean(name, &kept)
                } else {
                    self.weighted_mean(name, &kept)
                }
            }
            Builtin::ChauvenetMean => {
                let values = nominal(&items);
                let screen = stats::chauvenet_screen(
                    &values,
                    &vec![true; values.len()],
                    &self.settings.chauvenet,
                );
                let kept = keep(&items, &screen.included);
                self.scatter_mean(name, &kept)
            }
            Builtin::GeoMean => {
                let values = nominal(&items);
                let g = stats::geometric_mean(&values).map_err(kernel(name))?;
                let n = g.n as f64;
                let coefs: Vec<f64> = values.iter().map(|x| g.value / (n * x)).collect();
                let sigma = g.value * g.log_std_err;
                self.finish(name, g.value, sigma, linear_terms(&items, &coefs))
            }
            other => Err(EvalError::Misapplied {
                function: other.name(),
            }),
        }
    }

    /// Arithmetic mean with the standard error of the scatter as σ.
    fn scatter_mean(&self, name: &'static str, items: &[&Quantity]) -> Result<Quantity, EvalError> {
        let d = stats::describe(&nominal(items)).map_err(kernel(name))?;
        let coefs = vec![1.0 / d.n as f64; d.n];
        self.finish(name, d.mean, d.std_err, linear_terms(items, &coefs))
    }

    fn weighted_mean(&self, name: &'static str, items: &[&Quantity]) -> Result<Quantity, EvalError> {
        let wm = stats::weighted_mean(&nominal(items), &sigmas(items)).map_err(kernel(name))?;
        let sigma = wm.sigma(self.settings.error_policy);
        let terms = linear_terms(items, &wm.coefficients);
        self.finish(name, wm.mean, sigma, terms)
    }

    // -- Regression --

    /// Fit `y` against the nominal values of `x` over the positions where
    /// both are included, then read off a parameter or a prediction.
    pub(super) fn regression(
        &self,
        func: Builtin,
        y: &Series,
        x: &Series,
        x0: Option<&Quantity>,
    ) -> Result<Quantity, EvalError> {
        let name = func.name();
        if y.len() != x.len() {
            return Err(EvalError::LengthMismatch {
                left: y.len(),
                right: x.len(),
            });
        }
        let (ys, xs): (Vec<&Quantity>, Vec<f64>) = y
            .items
            .iter()
            .zip(&x.items)
            .filter_map(|pair| match pair {
                (Some(yi), Some(xi)) => Some((yi, xi.value)),
                _ => None,
            })
            .unzip();
        if ys.is_empty() {
            return Err(EvalError::EmptySeries { function: name });
        }

        let yv = nominal(&ys);
        let weighted = matches!(func, Builtin::WSlope | Builtin::WIntercept | Builtin::WPredict);
        let fit = if weighted {
            stats::weighted_fit(&xs, &yv, &sigmas(&ys))
        } else {
            stats::ordinary_fit(&xs, &yv)
        }
        .map_err(kernel(name))?;

        match func {
            Builtin::Slope | Builtin::WSlope => self.finish(
                name,
                fit.slope,
                fit.var_slope.max(0.0).sqrt(),
                linear_terms(&ys, &fit.d_slope_dy),
            ),
            Builtin::Intercept | Builtin::WIntercept => self.finish(
                name,
                fit.intercept,
                fit.var_intercept.max(0.0).sqrt(),
                linear_terms(&ys, &fit.d_intercept_dy),
            ),
            Builtin::Predict | Builtin::WPredict => {
                let x0 = x0.ok_or(EvalError::Misapplied { function: name })?;
                let (value, variance) = fit.predict(x0.value);
                let variance = variance + fit.slope * fit.slope * x0.variance();
                let coefs: Vec<f64> = fit
                    .d_intercept_dy
                    .iter()
                    .zip(&fit.d_slope_dy)
                    .map(|(da, db)| da + x0.value * db)
                    .collect();
                let terms = Terms::combine(&linear_terms(&ys, &coefs), 1.0, &x0.terms, fit.slope);
                self.finish(name, value, variance.sqrt(), terms)
            }
            other => Err(EvalError::Misapplied {
                function: other.name(),
            }),
        }
    }
}

fn kernel(function: &'static str) -> impl Fn(KernelError) -> EvalError {
    move |source| EvalError::Kernel { function, source }
}

fn nominal(items: &[&Quantity]) -> Vec<f64> {
    items.iter().map(|q| q.value).collect()
}

fn sigmas(items: &[&Quantity]) -> Vec<f64> {
    items.iter().map(|q| q.sigma).collect()
}

fn linear_terms(items: &[&Quantity], coefs: &[f64]) -> Terms {
    Terms::linear_sum(items.iter().zip(coefs).map(|(q, c)| (&q.terms, *c)))
}

fn keep<'q>(items: &[&'q Quantity], mask: &[bool]) -> Vec<&'q Quantity> {
    items
        .iter()
        .zip(mask)
        .filter_map(|(q, k)| k.then_some(*q))
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::error::EvalError;
    use crate::eval::testing::{MapScope, COORD};
    use crate::eval::{EvalSettings, Evaluator};
    use crate::formula::parse;
    use crate::quantity::Quantity;
    use crate::stats::{ErrorPolicy, KernelError};

    fn eval(text: &str, scope: &MapScope, settings: EvalSettings) -> Result<Quantity, EvalError> {
        Evaluator::new(settings, COORD, scope).scalar(&parse(text).unwrap())
    }

    fn run(text: &str, scope: &MapScope) -> Quantity {
        eval(text, scope, EvalSettings::default()).unwrap()
    }

    #[test]
    fn weighted_mean_of_two() {
        let scope = MapScope::default().series("r", &[(10.0, 1.0), (20.0, 1.0)], 0);
        let internal = EvalSettings {
            error_policy: ErrorPolicy::Internal,
            ..EvalSettings::default()
        };
        let q = eval("wmean(r)", &scope, internal).unwrap();
        assert_eq!(q.value, 15.0);
        assert!((q.sigma - 0.5f64.sqrt()).abs() < 1e-15);
        // default policy reports the larger, scatter-based error
        let q = run("wmean(r)", &scope);
        assert!((q.sigma - 5.0).abs() < 1e-12);
        assert_eq!(run("mswd(r)", &scope).value, 50.0);
    }

    #[test]
    fn filtered_mean_drops_outlier() {
        let scope = MapScope::default().series(
            "r",
            &[(10.0, 1.0), (10.0, 1.0), (10.0, 1.0), (100.0, 1.0)],
            0,
        );
        let q = run("filtered_mean(r)", &scope);
        assert_eq!(q.value, 10.0);
        assert_eq!(q.sigma, 0.0);
        assert_eq!(run("mean(r)", &scope).value, 32.5);
        assert_eq!(run("count(r)", &scope), Quantity::exact(4.0));
    }

    #[test]
    fn sum_and_mean_propagate() {
        let scope = MapScope::default().series("r", &[(1.0, 0.3), (2.0, 0.4)], 0);
        let s = run("sum(r)", &scope);
        assert_eq!(s.value, 3.0);
        assert!((s.sigma - 0.5).abs() < 1e-15);
        let m = run("mean(r)", &scope);
        assert_eq!(m.value, 1.5);
        assert!((m.sigma - 0.5).abs() < 1e-15);
    }

    #[test]
    fn regression_against_time() {
        let mut scope = MapScope::default().series(
            "r",
            &[(1.0, 0.1), (3.0, 0.1), (5.0, 0.1), (7.0, 0.1)],
            0,
        );
        let t = MapScope::default().series("t", &[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (3.0, 0.0)], 1);
        scope.times.insert("Pb206".into(), t.values["t"].clone());
        assert!((run("slope(r, time(Pb206))", &scope).value - 2.0).abs() < 1e-12);
        assert!((run("wintercept(r, time(Pb206))", &scope).value - 1.0).abs() < 1e-12);
        let p = run("wpredict(r, time(Pb206), 10)", &scope);
        assert!((p.value - 21.0).abs() < 1e-12);
        assert!(p.sigma > 0.0);
    }

    #[test]
    fn kernel_errors_are_attributed() {
        let scope = MapScope::default().series("r", &[(1.0, 0.1)], 0);
        assert_eq!(
            eval("mean(r)", &scope, EvalSettings::default()),
            Err(EvalError::Kernel {
                function: "mean",
                source: KernelError::InsufficientData { needed: 2, got: 1 }
            })
        );
        let scope = MapScope::default().series("r", &[(1.0, 0.0), (2.0, 0.0)], 0);
        assert!(matches!(
            eval("wmean(r)", &scope, EvalSettings::default()),
            Err(EvalError::Kernel {
                function: "wmean",
                source: KernelError::ZeroWeight { .. }
            })
        ));
    }

    #[test]
    fn empty_series() {
        let mut scope = MapScope::default().series("r", &[(1.0, 0.1)], 0);
        if let Some(crate::quantity::Operand::Series(s)) = scope.values.get_mut("r") {
            s.items[0] = None;
        }
        assert_eq!(
            eval("wmean(r)", &scope, EvalSettings::default()),
            Err(EvalError::EmptySeries { function: "wmean" })
        );
        assert_eq!(run("count(r)", &scope).value, 0.0);
    }

    #[test]
    fn geometric_mean_of_ratios() {
        let scope = MapScope::default().series("r", &[(0.5, 0.01), (2.0, 0.01)], 0);
        let g = run("geomean(r)", &scope);
        assert!((g.value - 1.0).abs() < 1e-12);
    }
}
