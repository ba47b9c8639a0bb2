use std::collections::{BTreeMap, HashMap};

use crate::error::EvalError;
use crate::formula::Expr;
use crate::quantity::{Operand, Quantity, Series, SourceId, Terms};
use crate::stats::{self, frame_seed, KernelError, NormalSampler};

use super::{Coord, EvalSettings, Evaluator, Scope};

/// Monte Carlo propagation of one step in one frame.
///
/// Every operand the formula reads is decomposed over its uncertainty
/// sources; each draw perturbs all sources jointly, so shared sources keep
/// their correlation. The result is the sample mean and sample standard
/// deviation; its decomposition is estimated from the draws.
pub fn evaluate(
    expr: &Expr,
    samples: usize,
    seed: u64,
    settings: EvalSettings,
    coord: Coord,
    scope: &dyn Scope,
) -> Result<Quantity, EvalError> {
    if samples < 2 {
        return Err(EvalError::Kernel {
            function: "monte carlo",
            source: KernelError::InsufficientData {
                needed: 2,
                got: samples,
            },
        });
    }

    // Nominal pass runs every numeric check once on the unperturbed inputs.
    let nominal = Evaluator::new(settings, coord, scope).scalar(expr)?;

    let bound: Vec<(&str, Operand)> = expr
        .references()
        .into_iter()
        .filter_map(|name| scope.operand(name).ok().map(|op| (name, op)))
        .collect();
    let plan = Plan::new(&bound);

    let draw_settings = EvalSettings {
        check_near_zero: false,
        correlated: false,
        ..settings
    };
    let mut sampler = NormalSampler::new(frame_seed(seed, coord.step, coord.block, coord.cycle));
    let mut z = vec![0.0; plan.dimension()];
    let mut outputs = Vec::with_capacity(samples);
    let mut sum_fz = vec![0.0; plan.sources.len()];
    let mut sum_z = vec![0.0; plan.sources.len()];

    for sample in 0..samples {
        for zi in z.iter_mut() {
            *zi = sampler.standard();
        }
        let drawn = SampledScope {
            bound: bound
                .iter()
                .enumerate()
                .map(|(i, (name, op))| (*name, plan.perturb(i, op, &z)))
                .collect(),
            inner: scope,
        };
        let f = Evaluator::new(draw_settings, coord, &drawn)
            .scalar(expr)
            .map_err(|e| EvalError::MonteCarlo {
                sample,
                source: Box::new(e),
            })?
            .value;
        for (s, zs) in z.iter().take(plan.sources.len()).enumerate() {
            sum_fz[s] += f * zs;
            sum_z[s] += zs;
        }
        outputs.push(f);
    }

    let d = stats::describe(&outputs).map_err(|source| EvalError::Kernel {
        function: "monte carlo",
        source,
    })?;
    let n = samples as f64;
    let terms = Terms::linear_sum(plan.sources.iter().enumerate().map(|(i, (_, unit))| {
        let cov = (sum_fz[i] - d.mean * sum_z[i]) / (n - 1.0);
        (unit, cov)
    }));
    log::debug!(
        "monte carlo step {} ({:?}, {:?}): nominal {} -> {} ± {} over {samples} draws",
        coord.step,
        coord.block,
        coord.cycle,
        nominal.value,
        d.mean,
        d.std_dev
    );

    if !d.mean.is_finite() || !d.std_dev.is_finite() {
        return Err(EvalError::NonFinite {
            operation: "monte carlo",
        });
    }
    Ok(Quantity {
        value: d.mean,
        sigma: d.std_dev,
        terms,
    }
    .with_residual(coord.derived(0)))
}

// ---------------------------------------------------------------------------
// Draw plan: which standard normal perturbs what
// ---------------------------------------------------------------------------

struct Plan {
    /// Shared sources in sorted order, each with its unit decomposition.
    sources: Vec<(SourceId, Terms)>,
    index: BTreeMap<SourceId, usize>,
    /// Private residual per bound quantity: (operand, element) → (z index, sd).
    residuals: HashMap<(usize, usize), (usize, f64)>,
}

impl Plan {
    fn new(bound: &[(&str, Operand)]) -> Self {
        let mut index = BTreeMap::new();
        for (_, op) in bound {
            for q in quantities(op) {
                for s in q.terms.sources() {
                    index.entry(s).or_insert(0);
                }
            }
        }
        for (i, slot) in index.values_mut().enumerate() {
            *slot = i;
        }
        let sources: Vec<(SourceId, Terms)> = index
            .keys()
            .map(|&s| (s, Terms::single(s, 1.0)))
            .collect();

        let mut residuals = HashMap::new();
        let mut next = sources.len();
        for (o, (_, op)) in bound.iter().enumerate() {
            for (e, q) in quantities(op).enumerate() {
                let excess = q.variance() - q.terms.norm_sq();
                if excess > f64::EPSILON * q.variance() && excess > 0.0 {
                    residuals.insert((o, e), (next, excess.sqrt()));
                    next += 1;
                }
            }
        }

        Plan {
            sources,
            index,
            residuals,
        }
    }

    fn dimension(&self) -> usize {
        self.sources.len() + self.residuals.len()
    }

    fn shift(&self, operand: usize, element: usize, q: &Quantity, z: &[f64]) -> Quantity {
        let mut value = q.value;
        for &(s, c) in q.terms.iter() {
            if let Some(&i) = self.index.get(&s) {
                value += c * z[i];
            }
        }
        if let Some(&(i, sd)) = self.residuals.get(&(operand, element)) {
            value += sd * z[i];
        }
        // keep σ so weights in wmean and friends stay meaningful
        Quantity {
            value,
            sigma: q.sigma,
            terms: Terms::none(),
        }
    }

    fn perturb(&self, operand: usize, op: &Operand, z: &[f64]) -> Operand {
        match op {
            Operand::Scalar(q) => Operand::Scalar(self.shift(operand, 0, q, z)),
            Operand::Series(s) => {
                let mut element = 0;
                let items = s
                    .items
                    .iter()
                    .map(|item| {
                        item.as_ref().map(|q| {
                            let out = self.shift(operand, element, q, z);
                            element += 1;
                            out
                        })
                    })
                    .collect();
                Operand::Series(Series::new(s.axis, items))
            }
        }
    }
}

/// Included quantities of an operand in element order.
fn quantities(op: &Operand) -> Box<dyn Iterator<Item = &Quantity> + '_> {
    match op {
        Operand::Scalar(q) => Box::new(std::iter::once(q)),
        Operand::Series(s) => Box::new(s.items.iter().flatten()),
    }
}

struct SampledScope<'a> {
    bound: HashMap<&'a str, Operand>,
    inner: &'a dyn Scope,
}

impl Scope for SampledScope<'_> {
    fn operand(&self, name: &str) -> Result<Operand, EvalError> {
        match self.bound.get(name) {
            Some(op) => Ok(op.clone()),
            None => self.inner.operand(name),
        }
    }

    fn times(&self, channel: &str) -> Result<Operand, EvalError> {
        self.inner.times(channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::testing::{MapScope, COORD};
    use crate::formula::parse;

    fn mc(text: &str, scope: &MapScope, samples: usize, seed: u64) -> Result<Quantity, EvalError> {
        evaluate(
            &parse(text).unwrap(),
            samples,
            seed,
            EvalSettings::default(),
            COORD,
            scope,
        )
    }

    #[test]
    fn reproducible_for_same_seed() {
        let scope = MapScope::default()
            .scalar("x", 2.0, 0.1, 0)
            .scalar("y", 3.0, 0.2, 1);
        let a = mc("x * y", &scope, 500, 9).unwrap();
        let b = mc("x * y", &scope, 500, 9).unwrap();
        assert_eq!(a.value.to_bits(), b.value.to_bits());
        assert_eq!(a.sigma.to_bits(), b.sigma.to_bits());
        let c = mc("x * y", &scope, 500, 10).unwrap();
        assert_ne!(a.value.to_bits(), c.value.to_bits());
    }

    #[test]
    fn approximates_linear_for_linear_formula() {
        let scope = MapScope::default()
            .scalar("x", 2.0, 0.3, 0)
            .scalar("y", 3.0, 0.4, 1);
        let q = mc("x + y", &scope, 20_000, 1).unwrap();
        assert!((q.value - 5.0).abs() < 0.02);
        assert!((q.sigma - 0.5).abs() < 0.02);
        // estimated decomposition recovers the input sensitivities
        assert!((q.terms.coefficient(SourceId::Constant(0)) - 0.3).abs() < 0.02);
    }

    #[test]
    fn shared_sources_stay_correlated() {
        let scope = MapScope::default().scalar("x", 5.0, 0.5, 0);
        let q = mc("x - x", &scope, 200, 3).unwrap();
        assert_eq!(q.value, 0.0);
        assert_eq!(q.sigma, 0.0);
    }

    #[test]
    fn nominal_checks_still_apply() {
        let scope = MapScope::default()
            .scalar("a", 1.0, 0.1, 0)
            .scalar("b", 0.0001, 1.0, 1);
        assert!(matches!(
            mc("a / b", &scope, 100, 1),
            Err(EvalError::NearZeroDivisor { .. })
        ));
    }

    #[test]
    fn draw_failures_name_the_sample() {
        // sqrt of a value one sigma from zero goes negative on some draw
        let scope = MapScope::default().scalar("x", 1.0, 1.0, 0);
        assert!(matches!(
            mc("sqrt(x)", &scope, 1000, 5),
            Err(EvalError::MonteCarlo { .. })
        ));
    }

    #[test]
    fn too_few_samples() {
        let scope = MapScope::default().scalar("x", 1.0, 1.0, 0);
        assert!(mc("x", &scope, 1, 5).is_err());
    }
}
