use crate::config::{ChauvenetConfig, OutlierConfig};

use super::descriptive::{describe, median};

/// Inclusion mask after screening, plus bookkeeping for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screening {
    pub included: Vec<bool>,
    pub passes: usize,
    pub rejected: usize,
}

/// Normal-consistency factor for the median absolute deviation.
const MAD_SCALE: f64 = 1.4826;
/// √(π/2): the same factor for the mean absolute deviation.
const MEAN_AD_SCALE: f64 = 1.253_314_137_315_500_3;

// ---------------------------------------------------------------------------
// Iterative robust screening
// ---------------------------------------------------------------------------

/// Reject values further than `threshold` robust standard deviations from
/// the median of the currently included values, repeating until a pass
/// rejects nothing or `max_passes` is reached.
///
/// `included` is the starting mask (user rejections); values already
/// excluded stay excluded. A pass is not attempted when fewer than
/// `min_count` values remain.
pub fn robust_screen(values: &[f64], included: &[bool], cfg: &OutlierConfig) -> Screening {
    let mut mask: Vec<bool> = values
        .iter()
        .enumerate()
        .map(|(i, _)| included.get(i).copied().unwrap_or(true))
        .collect();
    let mut passes = 0;
    let mut rejected = 0;

    while passes < cfg.max_passes {
        let kept: Vec<f64> = values
            .iter()
            .zip(&mask)
            .filter_map(|(v, keep)| keep.then_some(*v))
            .collect();
        if kept.len() < cfg.min_count.max(1) {
            break;
        }
        passes += 1;

        let Ok(centre) = median(&kept) else { break };
        let deviations: Vec<f64> = kept.iter().map(|v| (v - centre).abs()).collect();
        let mut scale = median(&deviations).unwrap_or(0.0) * MAD_SCALE;
        if scale == 0.0 {
            // More than half the values coincide; fall back to the mean
            // absolute deviation so a lone far value is still caught.
            scale = MEAN_AD_SCALE * deviations.iter().sum::<f64>() / deviations.len() as f64;
        }
        if scale == 0.0 {
            break;
        }

        let limit = cfg.threshold * scale;
        let mut newly = 0;
        for (v, keep) in values.iter().zip(mask.iter_mut()) {
            if *keep && (v - centre).abs() > limit {
                *keep = false;
                newly += 1;
            }
        }
        rejected += newly;
        if newly == 0 {
            break;
        }
    }

    Screening {
        included: mask,
        passes,
        rejected,
    }
}

// ---------------------------------------------------------------------------
// Chauvenet's criterion
// ---------------------------------------------------------------------------

/// Single pass of Chauvenet's criterion over the included values: reject
/// `x` when `n · erfc(|x − mean| / s) < probability`.
pub fn chauvenet_screen(values: &[f64], included: &[bool], cfg: &ChauvenetConfig) -> Screening {
    let mut mask: Vec<bool> = values
        .iter()
        .enumerate()
        .map(|(i, _)| included.get(i).copied().unwrap_or(true))
        .collect();
    let kept: Vec<f64> = values
        .iter()
        .zip(&mask)
        .filter_map(|(v, keep)| keep.then_some(*v))
        .collect();

    let mut rejected = 0;
    if kept.len() >= cfg.min_count {
        if let Ok(stats) = describe(&kept) {
            if stats.std_dev > 0.0 {
                let n = kept.len() as f64;
                for (v, keep) in values.iter().zip(mask.iter_mut()) {
                    if !*keep {
                        continue;
                    }
                    let z = (v - stats.mean).abs() / stats.std_dev;
                    if n * libm::erfc(z) < cfg.probability {
                        *keep = false;
                        rejected += 1;
                    }
                }
            }
        }
    }

    Screening {
        included: mask,
        passes: 1,
        rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_lone_outlier() {
        let values = [10.0, 10.0, 10.0, 100.0];
        let s = robust_screen(&values, &[true; 4], &OutlierConfig::default());
        assert_eq!(s.included, vec![true, true, true, false]);
        assert_eq!(s.rejected, 1);
        let kept: Vec<f64> = values
            .iter()
            .zip(&s.included)
            .filter_map(|(v, k)| k.then_some(*v))
            .collect();
        assert_eq!(kept.iter().sum::<f64>() / kept.len() as f64, 10.0);
    }

    #[test]
    fn clean_data_is_untouched() {
        let values = [9.8, 10.1, 10.0, 9.9, 10.2, 10.05];
        let s = robust_screen(&values, &[true; 6], &OutlierConfig::default());
        assert!(s.included.iter().all(|k| *k));
        assert_eq!(s.passes, 1);
    }

    #[test]
    fn respects_min_count_and_prior_mask() {
        let values = [1.0, 50.0, 1.1];
        let cfg = OutlierConfig {
            min_count: 4,
            ..OutlierConfig::default()
        };
        let s = robust_screen(&values, &[true, true, true], &cfg);
        assert_eq!(s.passes, 0);
        assert!(s.included.iter().all(|k| *k));

        let s = robust_screen(&values, &[true, false, true], &OutlierConfig::default());
        assert_eq!(s.included, vec![true, false, true]);
    }

    #[test]
    fn pass_limit_bounds_iteration() {
        let values = [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 10.0, 100.0, 1000.0];
        let cfg = OutlierConfig {
            max_passes: 1,
            ..OutlierConfig::default()
        };
        let s = robust_screen(&values, &[true; 9], &cfg);
        assert_eq!(s.passes, 1);
    }

    #[test]
    fn chauvenet_needs_minimum_count() {
        let mut values = vec![5.0; 25];
        values[3] = 5.2;
        values[7] = 4.9;
        values[20] = 9.0;
        let s = chauvenet_screen(&values, &vec![true; 25], &ChauvenetConfig::default());
        assert!(!s.included[20]);
        assert_eq!(s.rejected, 1);

        let s = chauvenet_screen(&values[..10], &[true; 10], &ChauvenetConfig::default());
        assert_eq!(s.rejected, 0);
    }

    #[test]
    fn chauvenet_rejects_two_sigma_point_in_twenty_five() {
        // 24 values alternating 9/11 and one at 12.3: |z| ≈ 2.006,
        // n · erfc(|z|) ≈ 0.11 sits below the 0.5 cut
        let mut values: Vec<f64> = (0..24).map(|i| if i % 2 == 0 { 9.0 } else { 11.0 }).collect();
        values.push(12.3);
        let s = chauvenet_screen(&values, &[true; 25], &ChauvenetConfig::default());
        assert!(!s.included[24]);
        assert_eq!(s.rejected, 1);
        assert!(s.included[..24].iter().all(|k| *k));
    }
}
