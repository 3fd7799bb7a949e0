use log::info;
use ndarray::{s, Array4, ArrayView4, Axis};
use num_complex::Complex32;
use rustfft::num_traits::Zero;

use crate::prelude::{StageError, StageResult, Visibilities};
use crate::state::Preferences;

// s GHz^2 cm^3 / pc
pub const DISPERSION_SCALE: f64 = 4.1488e-3;
const DM_GRID_STEP: f64 = 0.05;

// Fractional delays are truncated.
pub fn calc_delay(freq: &[f64], freqref: f64, dm: f64, inttime: f64) -> Vec<usize> {
    calc_delay2(freq, freqref, dm)
        .into_iter()
        .map(|delay| (delay / inttime).max(0.0) as usize)
        .collect()
}

pub fn calc_delay2(freq: &[f64], freqref: f64, dm: f64) -> Vec<f64> {
    freq.iter()
        .map(|&f| DISPERSION_SCALE * dm * (1.0 / (f * f) - 1.0 / (freqref * freqref)))
        .collect()
}

/// DM trials spaced so that no more than `dm_maxloss` of the sensitivity is
/// lost between neighbours, for an assumed pulse width of `dm_pulsewidth`.
pub fn calc_dmarr(prefs: &Preferences, inttime: f64, freq: &[f64], chansize_hz: f64) -> Vec<f64> {
    if prefs.maxdm == 0.0 || freq.is_empty() {
        return vec![0.0];
    }

    let tsamp = inttime * 1e6;
    let k = 8.3;
    let freq_mean = freq.iter().sum::<f64>() / freq.len() as f64;
    let freq_max = freq.iter().cloned().fold(f64::MIN, f64::max);
    let freq_min = freq.iter().cloned().fold(f64::MAX, f64::min);
    let bw = 1e3 * (freq_max - freq_min);
    let ch = 1e-6 * chansize_hz;
    let pulsewidth = prefs.dm_pulsewidth;

    let dt0 = |dm: f64| {
        (pulsewidth.powi(2) + tsamp.powi(2) + (k * dm * ch / freq_mean.powi(3)).powi(2)).sqrt()
    };
    let dt1 = |dm: f64, ddm: f64| {
        (pulsewidth.powi(2)
            + tsamp.powi(2)
            + (k * dm * ch / freq_mean.powi(3)).powi(2)
            + (k * ddm * bw / freq_mean.powi(3)).powi(2))
        .sqrt()
    };
    let loss = |dm: f64, ddm: f64| 1.0 - (dt0(dm) / dt1(dm, ddm)).sqrt();

    let ngrid = ((prefs.maxdm - prefs.mindm) / DM_GRID_STEP).ceil() as usize;
    let mut dmarr = vec![prefs.mindm];
    for step in 0..ngrid {
        let dm = prefs.mindm + step as f64 * DM_GRID_STEP;
        if dm >= prefs.maxdm {
            break;
        }
        let last = dmarr.last().copied().unwrap_or(prefs.mindm);
        if loss(dm, (dm - last) / 2.0) > prefs.dm_maxloss {
            dmarr.push(dm);
        }
    }
    if !dmarr.contains(&prefs.maxdm) {
        dmarr.push(prefs.maxdm);
    }
    dmarr
}

fn validate_delay(data: &ArrayView4<Complex32>, delay: &[usize]) -> StageResult<usize> {
    let (nint, _, nchan, _) = data.dim();
    if delay.len() != nchan {
        return Err(StageError::ShapeMismatch(format!(
            "{} delays for {} channels",
            delay.len(),
            nchan
        )));
    }
    let max_delay = delay.iter().copied().max().unwrap_or(0);
    if max_delay > nint {
        return Err(StageError::InvalidInput(format!(
            "delay of {} integrations exceeds {} available",
            max_delay, nint
        )));
    }
    Ok(max_delay)
}

fn empty_like(data: &ArrayView4<Complex32>) -> Visibilities {
    let (_, nbl, nchan, npol) = data.dim();
    Array4::zeros((0, nbl, nchan, npol))
}

/// Shifts each channel earlier in time by its delay, dropping the largest
/// delay from the end of the time axis.
pub fn dedisperse(data: ArrayView4<Complex32>, delay: &[usize]) -> StageResult<Visibilities> {
    let max_delay = validate_delay(&data, delay)?;
    if data.iter().all(|v| v.is_zero()) {
        return Ok(empty_like(&data));
    }

    info!(
        "Dedispersing up to delay shift of {} integrations",
        max_delay
    );

    let (nint, nbl, nchan, npol) = data.dim();
    let nout = nint - max_delay;
    let mut result = Array4::<Complex32>::zeros((nout, nbl, nchan, npol));
    for (k, &shift) in delay.iter().enumerate() {
        result
            .slice_mut(s![.., .., k, ..])
            .assign(&data.slice(s![shift..shift + nout, .., k, ..]));
    }
    Ok(result)
}

pub fn resample(data: ArrayView4<Complex32>, dt: usize) -> StageResult<Visibilities> {
    if dt == 0 {
        return Err(StageError::InvalidInput("resample factor must be positive".into()));
    }
    if data.iter().all(|v| v.is_zero()) {
        return Ok(empty_like(&data));
    }

    let (nint, nbl, nchan, npol) = data.dim();
    info!("Resampling data of length {} by a factor of {}", nint, dt);

    let nout = nint / dt;
    let mut result = Array4::<Complex32>::zeros((nout, nbl, nchan, npol));
    for (i, mut out) in result.outer_iter_mut().enumerate() {
        let summed = data.slice(s![i * dt..(i + 1) * dt, .., .., ..]).sum_axis(Axis(0));
        out.assign(&summed.mapv(|v| v / dt as f32));
    }
    Ok(result)
}

/// Dedisperses and resamples in one pass. Each output is the mean of the
/// non-zero samples that fall into it; all-zero bins stay zero.
pub fn dedisperse_resample(
    data: ArrayView4<Complex32>,
    delay: &[usize],
    dt: usize,
) -> StageResult<Visibilities> {
    if dt == 0 {
        return Err(StageError::InvalidInput("resample factor must be positive".into()));
    }
    let max_delay = validate_delay(&data, delay)?;
    if data.iter().all(|v| v.is_zero()) {
        return Ok(empty_like(&data));
    }

    info!(
        "Correcting by delay/resampling {}/{} ints",
        max_delay, dt
    );

    let (nint, nbl, nchan, npol) = data.dim();
    let nout = (nint - max_delay) / dt;
    let mut result = Array4::<Complex32>::zeros((nout, nbl, nchan, npol));
    for j in 0..nbl {
        for l in 0..npol {
            for (k, &shift) in delay.iter().enumerate() {
                for i in 0..nout {
                    let mut sum = Complex32::zero();
                    let mut weight = 0usize;
                    for r in 0..dt {
                        let value = data[[i * dt + shift + r, j, k, l]];
                        if !value.is_zero() {
                            sum += value;
                            weight += 1;
                        }
                    }
                    if weight > 0 {
                        result[[i, j, k, l]] = sum / weight as f32;
                    }
                }
            }
        }
    }
    Ok(result)
}
