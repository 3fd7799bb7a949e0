use std::f64::consts::{LN_2, SQRT_2};

/// Scale between the median absolute deviation and a Gaussian sigma.
pub const MAD_TO_STD: f64 = 1.4826;

pub struct StatsHelper;

impl StatsHelper {
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|&v| v * v).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    pub fn mean(samples: &[f64]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    /// Population standard deviation (numpy's default `ddof=0`).
    pub fn std(samples: &[f64]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let mean = Self::mean(samples);
        let var = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        var.sqrt()
    }

    pub fn median(samples: &[f64]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }

    /// Robust sigma estimate from the median absolute deviation.
    pub fn mad_to_std(samples: &[f64]) -> f64 {
        let median = Self::median(samples);
        let deviations: Vec<f64> = samples.iter().map(|v| (v - median).abs()).collect();
        MAD_TO_STD * Self::median(&deviations)
    }

    /// Percentile with linear interpolation between closest ranks.
    pub fn percentile(samples: &[f64], q: f64) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let frac = rank - lower as f64;
        sorted[lower] + (sorted[upper] - sorted[lower]) * frac
    }

    /// Least-squares line through `(x, y)`; returns `(slope, intercept)`.
    pub fn polyfit_linear(x: &[f64], y: &[f64]) -> (f64, f64) {
        let n = x.len().min(y.len());
        if n == 0 {
            return (0.0, 0.0);
        }
        let mean_x = Self::mean(&x[..n]);
        let mean_y = Self::mean(&y[..n]);
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        for (xi, yi) in x.iter().zip(y.iter()).take(n) {
            sxy += (xi - mean_x) * (yi - mean_y);
            sxx += (xi - mean_x).powi(2);
        }
        if sxx == 0.0 {
            return (0.0, mean_y);
        }
        let slope = sxy / sxx;
        (slope, mean_y - slope * mean_x)
    }

    /// Natural log of the standard normal survival function, `ln P(Z > x)`.
    pub fn norm_logsf(x: f64) -> f64 {
        if x >= 0.0 {
            ln_erfc_nonnegative(x / SQRT_2) - LN_2
        } else {
            (1.0 - 0.5 * ln_erfc_nonnegative(-x / SQRT_2).exp()).ln()
        }
    }
}

/// `ln(erfc(z))` for `z >= 0` from the Chebyshev fit of Press et al.
/// (fractional error below 1.2e-7). Evaluated in log space so the far
/// tail never underflows.
fn ln_erfc_nonnegative(z: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    t.ln() - z * z + poly
}
