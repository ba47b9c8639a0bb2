use serde::{Deserialize, Serialize};

use super::{require, KernelError};

/// Which uncertainty a weighted mean reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Propagated from the input uncertainties only.
    Internal,
    /// Internal error scaled by √MSWD.
    External,
    /// Larger of the two.
    #[default]
    LargerOfInternalExternal,
}

/// Inverse-variance weighted mean of `(value, sigma)` pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedMean {
    pub n: usize,
    pub mean: f64,
    pub internal_sigma: f64,
    pub external_sigma: f64,
    /// Reduced chi-square; undefined for a single value.
    pub mswd: Option<f64>,
    /// Normalised weights `w_i / Σw`, i.e. `∂mean/∂x_i`.
    pub coefficients: Vec<f64>,
}

impl WeightedMean {
    pub fn sigma(&self, policy: ErrorPolicy) -> f64 {
        match policy {
            ErrorPolicy::Internal => self.internal_sigma,
            ErrorPolicy::External => self.external_sigma,
            ErrorPolicy::LargerOfInternalExternal => self.internal_sigma.max(self.external_sigma),
        }
    }
}

pub fn weighted_mean(values: &[f64], sigmas: &[f64]) -> Result<WeightedMean, KernelError> {
    let n = values.len().min(sigmas.len());
    require(1, n)?;

    let mut weights = Vec::with_capacity(n);
    for (index, &sigma) in sigmas[..n].iter().enumerate() {
        let w = 1.0 / (sigma * sigma);
        if sigma == 0.0 || !w.is_finite() {
            return Err(KernelError::ZeroWeight { index, sigma });
        }
        weights.push(w);
    }

    let sum_w: f64 = weights.iter().sum();
    let mean = values[..n]
        .iter()
        .zip(&weights)
        .map(|(x, w)| w * x)
        .sum::<f64>()
        / sum_w;
    let internal_sigma = 1.0 / sum_w.sqrt();

    let mswd = if n > 1 {
        let chi2: f64 = values[..n]
            .iter()
            .zip(&weights)
            .map(|(x, w)| w * (x - mean) * (x - mean))
            .sum();
        Some(chi2 / (n - 1) as f64)
    } else {
        None
    };
    let external_sigma = match mswd {
        Some(m) => internal_sigma * m.sqrt(),
        None => internal_sigma,
    };

    Ok(WeightedMean {
        n,
        mean,
        internal_sigma,
        external_sigma,
        mswd,
        coefficients: weights.iter().map(|w| w / sum_w).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_equal_weights() {
        let wm = weighted_mean(&[10.0, 20.0], &[1.0, 1.0]).unwrap();
        assert_eq!(wm.mean, 15.0);
        assert!((wm.internal_sigma - 1.0 / 2f64.sqrt()).abs() < 1e-15);
        // chi2 = 25 + 25, one degree of freedom
        assert_eq!(wm.mswd, Some(50.0));
        assert_eq!(wm.sigma(ErrorPolicy::Internal), wm.internal_sigma);
        assert_eq!(
            wm.sigma(ErrorPolicy::LargerOfInternalExternal),
            wm.external_sigma
        );
    }

    #[test]
    fn equal_sigmas_give_arithmetic_mean() {
        let xs = [1.5, 2.25, 7.0, -3.0];
        let wm = weighted_mean(&xs, &[0.3; 4]).unwrap();
        let arithmetic = xs.iter().sum::<f64>() / 4.0;
        assert!((wm.mean - arithmetic).abs() < 1e-12);
    }

    #[test]
    fn single_value_has_no_mswd() {
        let wm = weighted_mean(&[4.0], &[0.5]).unwrap();
        assert_eq!(wm.mswd, None);
        assert_eq!(wm.external_sigma, wm.internal_sigma);
        assert_eq!(wm.internal_sigma, 0.5);
    }

    #[test]
    fn zero_sigma_is_rejected() {
        assert_eq!(
            weighted_mean(&[1.0, 2.0], &[1.0, 0.0]),
            Err(KernelError::ZeroWeight {
                index: 1,
                sigma: 0.0
            })
        );
    }

    #[test]
    fn weights_favour_precise_values() {
        let wm = weighted_mean(&[0.0, 10.0], &[1.0, 3.0]).unwrap();
        assert!((wm.mean - 1.0).abs() < 1e-12);
        assert!((wm.coefficients.iter().sum::<f64>() - 1.0).abs() < 1e-15);
    }
}
