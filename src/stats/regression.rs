use super::{require, KernelError};

/// A fitted straight line `y = intercept + slope·x` with the parameter
/// covariance and the sensitivities of both parameters to every `y_i`.
#[derive(Debug, Clone, PartialEq)]
pub struct LineFit {
    pub n: usize,
    pub slope: f64,
    pub intercept: f64,
    pub var_slope: f64,
    pub var_intercept: f64,
    pub covariance: f64,
    pub d_slope_dy: Vec<f64>,
    pub d_intercept_dy: Vec<f64>,
}

impl LineFit {
    /// Fitted value at `x0` and its variance from the parameter covariance.
    pub fn predict(&self, x0: f64) -> (f64, f64) {
        let value = self.intercept + self.slope * x0;
        let variance =
            self.var_intercept + x0 * x0 * self.var_slope + 2.0 * x0 * self.covariance;
        (value, variance.max(0.0))
    }
}

fn has_spread(x: &[f64]) -> bool {
    let (lo, hi) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    hi > lo
}

/// Ordinary least squares. Parameter variances come from the residual
/// scatter, so at least three points are needed.
pub fn ordinary_fit(x: &[f64], y: &[f64]) -> Result<LineFit, KernelError> {
    let n = x.len().min(y.len());
    require(3, n)?;
    let (x, y) = (&x[..n], &y[..n]);
    if !has_spread(x) {
        return Err(KernelError::Degenerate);
    }

    let nf = n as f64;
    let x_bar = x.iter().sum::<f64>() / nf;
    let y_bar = y.iter().sum::<f64>() / nf;
    let sxx: f64 = x.iter().map(|xi| (xi - x_bar) * (xi - x_bar)).sum();
    let sxy: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| (xi - x_bar) * (yi - y_bar))
        .sum();

    let slope = sxy / sxx;
    let intercept = y_bar - slope * x_bar;
    let ss_res: f64 = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| {
            let r = yi - intercept - slope * xi;
            r * r
        })
        .sum();
    let s2 = ss_res / (nf - 2.0);

    let d_slope_dy: Vec<f64> = x.iter().map(|xi| (xi - x_bar) / sxx).collect();
    let d_intercept_dy: Vec<f64> = d_slope_dy.iter().map(|db| 1.0 / nf - x_bar * db).collect();

    Ok(LineFit {
        n,
        slope,
        intercept,
        var_slope: s2 / sxx,
        var_intercept: s2 * (1.0 / nf + x_bar * x_bar / sxx),
        covariance: -x_bar * s2 / sxx,
        d_slope_dy,
        d_intercept_dy,
    })
}

/// Weighted least squares with `w_i = 1/σy_i²`. Parameter variances come
/// from the weights alone.
pub fn weighted_fit(x: &[f64], y: &[f64], sigma_y: &[f64]) -> Result<LineFit, KernelError> {
    let n = x.len().min(y.len()).min(sigma_y.len());
    require(2, n)?;
    let (x, y) = (&x[..n], &y[..n]);
    if !has_spread(x) {
        return Err(KernelError::Degenerate);
    }

    let mut w = Vec::with_capacity(n);
    for (index, &sigma) in sigma_y[..n].iter().enumerate() {
        let wi = 1.0 / (sigma * sigma);
        if sigma == 0.0 || !wi.is_finite() {
            return Err(KernelError::ZeroWeight { index, sigma });
        }
        w.push(wi);
    }

    let s: f64 = w.iter().sum();
    let sx: f64 = w.iter().zip(x).map(|(wi, xi)| wi * xi).sum();
    let sy: f64 = w.iter().zip(y).map(|(wi, yi)| wi * yi).sum();
    // centred sums keep Δ well conditioned
    let xw = sx / s;
    let sxx_c: f64 = w.iter().zip(x).map(|(wi, xi)| wi * (xi - xw) * (xi - xw)).sum();
    let delta = s * sxx_c;
    if delta <= 0.0 || !delta.is_finite() {
        return Err(KernelError::Degenerate);
    }
    let sxx = sxx_c + sx * sx / s;
    let sxy: f64 = w
        .iter()
        .zip(x.iter().zip(y))
        .map(|(wi, (xi, yi))| wi * xi * yi)
        .sum();

    let slope = (s * sxy - sx * sy) / delta;
    let intercept = (sxx * sy - sx * sxy) / delta;

    Ok(LineFit {
        n,
        slope,
        intercept,
        var_slope: s / delta,
        var_intercept: sxx / delta,
        covariance: -sx / delta,
        d_slope_dy: w
            .iter()
            .zip(x)
            .map(|(wi, xi)| wi * (s * xi - sx) / delta)
            .collect(),
        d_intercept_dy: w
            .iter()
            .zip(x)
            .map(|(wi, xi)| wi * (sxx - sx * xi) / delta)
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_line_has_zero_residual() {
        let x = [0.0, 1.0, 2.0, 3.0];
        let y = [1.0, 3.0, 5.0, 7.0];
        let fit = ordinary_fit(&x, &y).unwrap();
        assert!((fit.slope - 2.0).abs() < 1e-12);
        assert!((fit.intercept - 1.0).abs() < 1e-12);
        assert!(fit.var_slope.abs() < 1e-20);
        let (v, var) = fit.predict(10.0);
        assert!((v - 21.0).abs() < 1e-12);
        assert!(var.abs() < 1e-18);
    }

    #[test]
    fn sensitivities_reproduce_parameters() {
        let x = [1.0, 2.0, 4.0, 7.0];
        let y = [2.0, 2.5, 4.5, 6.0];
        let fit = ordinary_fit(&x, &y).unwrap();
        let b: f64 = fit.d_slope_dy.iter().zip(&y).map(|(d, yi)| d * yi).sum();
        let a: f64 = fit.d_intercept_dy.iter().zip(&y).map(|(d, yi)| d * yi).sum();
        assert!((b - fit.slope).abs() < 1e-12);
        assert!((a - fit.intercept).abs() < 1e-12);
    }

    #[test]
    fn weighted_with_equal_sigmas_matches_ordinary() {
        let x = [1.0, 2.0, 4.0, 7.0];
        let y = [2.0, 2.5, 4.5, 6.0];
        let ols = ordinary_fit(&x, &y).unwrap();
        let wls = weighted_fit(&x, &y, &[0.5; 4]).unwrap();
        assert!((ols.slope - wls.slope).abs() < 1e-12);
        assert!((ols.intercept - wls.intercept).abs() < 1e-12);
        let b: f64 = wls.d_slope_dy.iter().zip(&y).map(|(d, yi)| d * yi).sum();
        assert!((b - wls.slope).abs() < 1e-12);
    }

    #[test]
    fn weighted_variances_from_sigmas() {
        // S = 2, Sx = 2, Sxx = 4, Δ = 4
        let fit = weighted_fit(&[0.0, 2.0], &[0.0, 2.0], &[1.0, 1.0]).unwrap();
        assert!((fit.var_slope - 0.5).abs() < 1e-15);
        assert!((fit.var_intercept - 1.0).abs() < 1e-15);
        assert!((fit.covariance + 0.5).abs() < 1e-15);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(
            ordinary_fit(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]),
            Err(KernelError::Degenerate)
        );
        assert_eq!(
            ordinary_fit(&[1.0, 2.0], &[1.0, 2.0]),
            Err(KernelError::InsufficientData { needed: 3, got: 2 })
        );
        assert!(matches!(
            weighted_fit(&[1.0, 2.0], &[1.0, 2.0], &[1.0, 0.0]),
            Err(KernelError::ZeroWeight { index: 1, .. })
        ));
    }
}
