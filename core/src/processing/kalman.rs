//! Kalman-filter significance of a smoothly varying spectrum against noise.

use std::f64::consts::{LN_2, PI};

use log::{debug, info};
use ndarray::Axis;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::interface::candidate::CandData;
use crate::math::stats::StatsHelper;
use crate::prelude::{StageError, StageResult};

const ON_PULSE_GUARD: usize = 5;

// multiples of the median noise
const DEFAULT_SIG_T_FACTORS: [f64; 4] = [0.3, 0.1, 0.03, 0.01];

/// Smoothness scales with their calibrated tail fits `(slope, intercept)`.
#[derive(Debug, Clone, PartialEq)]
pub struct KalmanCoeffs {
    pub sig_ts: Vec<f64>,
    pub coeffs: Vec<(f64, f64)>,
}

pub fn default_sig_ts(spec_std: &[f64]) -> Vec<f64> {
    let median = StatsHelper::median(spec_std);
    DEFAULT_SIG_T_FACTORS.iter().map(|f| f * median).collect()
}

/// Log-likelihood ratio of a random-walk model (step scale `sig_t`) over
/// pure noise for `spec` with per-channel noise `spec_std`.
pub fn kalman_filter_detector(
    spec: &[f64],
    spec_std: &[f64],
    sig_t: f64,
    a0: Option<f64>,
    sig0: Option<f64>,
) -> f64 {
    let mean = StatsHelper::mean(spec);
    let mut cur_mu = a0.unwrap_or(mean);
    let sig0 = sig0.unwrap_or_else(|| StatsHelper::median(spec_std));
    let mut cur_state_v = sig0 * sig0;
    let sig_t_sq = sig_t * sig_t;

    let mut cur_log_l = 0.0;
    let mut h0_log_l = 0.0;
    for (&value, &std) in spec.iter().zip(spec_std.iter()) {
        let cur_z = value - mean;
        let cur_spec_v = std * std;
        let total_v = cur_state_v + cur_spec_v + sig_t_sq;

        cur_log_l += -(cur_z - cur_mu).powi(2) / total_v / 2.0 - 0.5 * (2.0 * PI * total_v).ln();

        cur_mu = (cur_mu / cur_state_v + cur_z / cur_spec_v) / (1.0 / cur_state_v + 1.0 / cur_spec_v);
        cur_state_v = cur_spec_v * cur_state_v / (cur_spec_v + cur_state_v) + sig_t_sq;

        h0_log_l += -cur_z * cur_z / cur_spec_v / 2.0 - 0.5 * (2.0 * PI * cur_spec_v).ln();
    }
    cur_log_l - h0_log_l
}

/// Calibrates the score distribution on `n_trial` noise spectra and fits
/// its exponential tail for each smoothness scale.
pub fn kalman_prepare_coeffs<R: Rng + ?Sized>(
    spec_std: &[f64],
    sig_ts: Option<Vec<f64>>,
    n_trial: usize,
    rng: &mut R,
) -> StageResult<KalmanCoeffs> {
    if spec_std.is_empty() {
        return Err(StageError::InvalidInput("noise spectrum is empty".into()));
    }
    if let Some(bad) = spec_std.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
        return Err(StageError::InvalidInput(format!(
            "noise spectrum must be positive, found {}",
            bad
        )));
    }
    if n_trial == 0 {
        return Err(StageError::InvalidInput("at least one trial required".into()));
    }

    let sig_ts = sig_ts.unwrap_or_else(|| default_sig_ts(spec_std));
    info!("Measuring Kalman significance distribution for sig_ts {:?}", sig_ts);

    let noise: Vec<Normal<f64>> = spec_std
        .iter()
        .map(|&std| Normal::new(0.0, std).map_err(|err| StageError::InvalidInput(err.to_string())))
        .collect::<StageResult<_>>()?;

    let mut coeffs = Vec::with_capacity(sig_ts.len());
    for &sig_t in &sig_ts {
        let scores: Vec<f64> = (0..n_trial)
            .map(|_| {
                let mut draw: Vec<f64> = noise.iter().map(|dist| dist.sample(&mut *rng)).collect();
                let mean = StatsHelper::mean(&draw);
                draw.iter_mut().for_each(|v| *v -= mean);
                kalman_filter_detector(&draw, spec_std, sig_t, None, None)
            })
            .collect();

        let levels: Vec<f64> = (3..10).map(|i| i as f64).collect();
        let quantiles: Vec<f64> = levels
            .iter()
            .map(|&i| StatsHelper::percentile(&scores, 100.0 * (1.0 - 2f64.powf(-i))))
            .collect();
        coeffs.push(StatsHelper::polyfit_linear(&quantiles, &levels));
    }

    Ok(KalmanCoeffs { sig_ts, coeffs })
}

// nats
pub fn kalman_significance(spec: &[f64], spec_std: &[f64], coeffs: &KalmanCoeffs) -> f64 {
    debug!(
        "Calculating max Kalman significance for {} channel spectrum",
        spec.len()
    );
    coeffs
        .sig_ts
        .iter()
        .zip(coeffs.coeffs.iter())
        .map(|(&sig_t, &(slope, intercept))| {
            slope * kalman_filter_detector(spec, spec_std, sig_t, None, None) + intercept
        })
        .fold(f64::NEG_INFINITY, f64::max)
        * LN_2
}

/// Combined image and spectral significance of a candidate, as a
/// Gaussian-equivalent signal-to-noise. The noise spectrum is measured on
/// window rows away from the candidate integration.
pub fn kalman_significance_canddata<R: Rng + ?Sized>(
    canddata: &CandData,
    sig_ts: Option<Vec<f64>>,
    n_trial: usize,
    rng: &mut R,
) -> StageResult<f64> {
    let onint = canddata.window_offset;
    let rows: Vec<Vec<f64>> = canddata
        .data
        .outer_iter()
        .map(|row| {
            row.outer_iter()
                .map(|pols| {
                    let npol = pols.len().max(1) as f64;
                    pols.iter().map(|v| v.re as f64).sum::<f64>() / npol
                })
                .collect()
        })
        .collect();
    let offrows: Vec<&Vec<f64>> = rows
        .iter()
        .enumerate()
        .filter(|(i, _)| i.abs_diff(onint) >= ON_PULSE_GUARD)
        .map(|(_, row)| row)
        .collect();
    if offrows.len() < 2 || onint >= rows.len() {
        return Err(StageError::InvalidInput(format!(
            "window of {} integrations leaves {} off-pulse rows",
            rows.len(),
            offrows.len()
        )));
    }

    let spec_full = canddata.spectrum();
    let nchan = canddata.data.len_of(Axis(1));
    let (spec, spec_std): (Vec<f64>, Vec<f64>) = (0..nchan)
        .map(|ch| {
            let column: Vec<f64> = offrows.iter().map(|row| row[ch]).collect();
            (spec_full[ch], StatsHelper::std(&column))
        })
        .filter(|(_, std)| *std > 0.0)
        .unzip();
    if spec.is_empty() {
        return Err(StageError::InvalidInput(
            "no channel has measurable off-pulse noise".into(),
        ));
    }

    let coeffs = kalman_prepare_coeffs(&spec_std, sig_ts, n_trial, rng)?;
    let significance_kalman = kalman_significance(&spec, &spec_std, &coeffs);

    let pixels: Vec<f64> = canddata.image.iter().map(|&v| v as f64).collect();
    let image_std = StatsHelper::std(&pixels);
    if image_std <= 0.0 {
        return Err(StageError::InvalidInput("candidate image is flat".into()));
    }
    let immax = pixels.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let significance_image = -StatsHelper::norm_logsf(immax / image_std);
    debug!(
        "Candidate significance: kalman {:.2}, image {:.2}",
        significance_kalman, significance_image
    );

    Ok((2.0 * (significance_kalman + significance_image)).max(0.0).sqrt())
}
