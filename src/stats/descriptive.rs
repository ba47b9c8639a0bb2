use super::{require, KernelError};

/// Block statistics of a plain sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Describe {
    pub n: usize,
    pub mean: f64,
    /// Sample variance (n − 1 denominator).
    pub variance: f64,
    pub std_dev: f64,
    pub std_err: f64,
}

/// Mean, sample variance, standard deviation and standard error.
/// Two-pass so large offsets do not cancel.
pub fn describe(values: &[f64]) -> Result<Describe, KernelError> {
    let n = values.len();
    require(2, n)?;
    let mean = values.iter().sum::<f64>() / n as f64;
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    let variance = ss / (n - 1) as f64;
    let std_dev = variance.sqrt();
    Ok(Describe {
        n,
        mean,
        variance,
        std_dev,
        std_err: std_dev / (n as f64).sqrt(),
    })
}

/// Median of a non-empty sample.
pub fn median(values: &[f64]) -> Result<f64, KernelError> {
    require(1, values.len())?;
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    Ok(if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    })
}

// ---------------------------------------------------------------------------
// Geometric mean (ratio convention)
// ---------------------------------------------------------------------------

/// Log-space mean of strictly positive values.
///
/// Ratios are averaged as `exp(mean(ln r))`; the ±1σ bounds are asymmetric in
/// linear space, `upper = exp(m + se) - exp(m)`, `lower = exp(m) - exp(m - se)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeometricMean {
    pub n: usize,
    pub value: f64,
    pub log_mean: f64,
    pub log_std_err: f64,
    pub upper: f64,
    pub lower: f64,
}

pub fn geometric_mean(values: &[f64]) -> Result<GeometricMean, KernelError> {
    if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| **v <= 0.0) {
        return Err(KernelError::NonPositive { index, value });
    }
    let logs: Vec<f64> = values.iter().map(|v| v.ln()).collect();
    let stats = describe(&logs)?;
    let value = stats.mean.exp();
    Ok(GeometricMean {
        n: stats.n,
        value,
        log_mean: stats.mean,
        log_std_err: stats.std_err,
        upper: (stats.mean + stats.std_err).exp() - value,
        lower: value - (stats.mean - stats.std_err).exp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describes_small_sample() {
        let d = describe(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(d.mean, 5.0);
        assert!((d.variance - 32.0 / 7.0).abs() < 1e-12);
        assert!((d.std_err - d.std_dev / 8f64.sqrt()).abs() < 1e-15);
    }

    #[test]
    fn large_offset_does_not_lose_precision() {
        let base = 1e9;
        let d = describe(&[base + 1.0, base + 2.0, base + 3.0]).unwrap();
        assert!((d.variance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn single_value_is_insufficient() {
        assert_eq!(
            describe(&[1.0]),
            Err(KernelError::InsufficientData { needed: 2, got: 1 })
        );
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]).unwrap(), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]).unwrap(), 2.5);
        assert!(median(&[]).is_err());
    }

    #[test]
    fn geometric_mean_of_ratios() {
        let g = geometric_mean(&[0.5, 2.0]).unwrap();
        assert!((g.value - 1.0).abs() < 1e-15);
        assert!(g.upper > g.lower);
        assert!(matches!(
            geometric_mean(&[1.0, -1.0]),
            Err(KernelError::NonPositive { index: 1, .. })
        ));
    }
}
