//! Synthetic segment data: Gaussian noise visibilities with injected
//! dispersed transients.

use std::f64::consts::PI;

use log::info;
use ndarray::{Array2, Array4, Axis};
use num_complex::Complex32;
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::math::stats::StatsHelper;
use crate::prelude::{StageError, StageResult, Visibilities};
use crate::processing::calibrate::{flag_channels, meantsub};
use crate::processing::dedisperse::calc_delay2;
use crate::state::{SimulatedTransient, State};
use crate::telemetry::log::LogManager;

/// Fixed values for `make_transient_params`; anything left `None` is drawn
/// at random.
#[derive(Debug, Clone, Default)]
pub struct TransientOverrides {
    pub segment: Option<usize>,
    pub dmind: Option<usize>,
    pub dtind: Option<usize>,
    pub integration: Option<f64>,
    pub amp: Option<f64>,
    pub lm: Option<(f64, f64)>,
    // only used when data is given
    pub snr: Option<f64>,
}

/// Dynamic spectrum `(nchan, readints)` of a pulse of amplitude `amp`
/// starting at integration `i0` at the top of the band, with width `dt`
/// seconds. `ampslope` adds a linear ramp reaching `amp + ampslope` in the
/// last channel.
pub fn make_transient_data(
    state: &State,
    amp: f64,
    i0: f64,
    dm: f64,
    dt: f64,
    ampslope: f64,
) -> Array2<Complex32> {
    let nchan = state.nchan();
    let readints = state.readints();
    let inttime = state.inttime();
    let width = dt / inttime;
    let freq_max = state.freq.iter().cloned().fold(f64::MIN, f64::max);
    let delays = calc_delay2(&state.freq, freq_max, dm);

    let mut model = Array2::<Complex32>::zeros((nchan, readints));
    let mut broadened = 0usize;
    for (k, delay) in delays.iter().enumerate() {
        let ramp = if nchan > 1 {
            k as f64 / (nchan - 1) as f64
        } else {
            0.0
        };
        let ampspec = amp + ampslope * ramp;

        let i = i0 + delay / inttime;
        let imin = i.floor();
        let imax = (i + width).ceil();
        let weights: Vec<f64> = match (imax - imin) as i64 {
            1 => vec![1.0],
            2 => {
                let f1 = (width - (i.ceil() - i)) / width;
                vec![1.0 - f1, f1]
            }
            3 => {
                let f2 = (i + width - (imax - 1.0)) / width;
                let f0 = (imin + 1.0 - i) / width;
                vec![f0, 1.0 - f2 - f0, f2]
            }
            _ => {
                broadened += 1;
                continue;
            }
        };

        for (offset, weight) in weights.into_iter().enumerate() {
            let index = imin as i64 + offset as i64;
            if index >= 0 && (index as usize) < readints {
                model[[k, index as usize]] += Complex32::new((weight * ampspec) as f32, 0.0);
            }
        }
    }
    if broadened > 0 {
        LogManager::new("source").caution(&format!(
            "{} channels broadened over 4 or more integrations or of zero width; not injected",
            broadened
        ));
    }
    model
}

/// Draws `ntr` transients that the search should be able to detect. With
/// `data`, amplitudes are scaled to a target signal-to-noise measured
/// from that segment. Every transient has either `l` or `m` equal to zero.
pub fn make_transient_params<R: Rng + ?Sized>(
    state: &State,
    ntr: usize,
    overrides: &TransientOverrides,
    data: Option<&Visibilities>,
    rng: &mut R,
) -> StageResult<Vec<SimulatedTransient>> {
    let dmmin = state.dmarr.iter().cloned().fold(f64::MAX, f64::min);
    let dmmax = state.dmarr.iter().cloned().fold(f64::MIN, f64::max);
    let dtmin = state.dtarr.iter().copied().min().unwrap_or(1) as f64;
    let dtmax = state.dtarr.iter().copied().max().unwrap_or(1) as f64;
    let halffield = state.fieldsize_deg().to_radians() / 2.0;

    let mut mocks = Vec::with_capacity(ntr);
    for _ in 0..ntr {
        let segment = overrides
            .segment
            .unwrap_or_else(|| rng.gen_range(0..state.nsegment().max(1)));
        state.segment_bounds(segment)?;

        let (dm, dmind) = match overrides.dmind {
            Some(dmind) => {
                let dm = *state.dmarr.get(dmind).ok_or_else(|| {
                    StageError::InvalidInput(format!("dmind {} outside DM grid", dmind))
                })?;
                (dm, dmind)
            }
            None => {
                let dm = if dmmax > dmmin {
                    rng.gen_range(dmmin..dmmax)
                } else {
                    dmmin
                };
                (dm, state.dmind_for(dm))
            }
        };

        let (dt, dtind) = match overrides.dtind {
            Some(dtind) => {
                let factor = *state.dtarr.get(dtind).ok_or_else(|| {
                    StageError::InvalidInput(format!("dtind {} outside dt grid", dtind))
                })?;
                (state.inttime() * factor.min(2) as f64, dtind)
            }
            None => {
                let factor = if dtmax > dtmin {
                    rng.gen_range(dtmin..dtmax)
                } else {
                    dtmin
                };
                let dtind = factor.log2().floor().max(0.0) as usize;
                if dtind >= state.dtarr.len() {
                    LogManager::new("source")
                        .caution("Width of transient is greater than max dt searched.");
                }
                (
                    state.inttime() * factor,
                    dtind.min(state.dtarr.len().saturating_sub(1)),
                )
            }
        };

        let integration = match overrides.integration {
            Some(integration) => integration,
            None => {
                let ints = state.get_search_ints(segment, dmind, dtind);
                let choice = ints.choose(rng).ok_or_else(|| {
                    StageError::InvalidInput(format!(
                        "no searchable integrations in segment {}",
                        segment
                    ))
                })?;
                (choice * state.dtarr[dtind]) as f64
            }
        };

        let amp = match (overrides.amp, data) {
            (Some(amp), _) => amp,
            (None, None) => {
                let amp = rng.gen_range(0.1..0.5);
                info!("Setting mock amp to {}", amp);
                amp
            }
            (None, Some(data)) => {
                let snr = overrides.snr.unwrap_or_else(|| rng.gen_range(10.0..50.0));
                let index = integration as usize;
                if index >= data.len_of(Axis(0)) {
                    return Err(StageError::InvalidInput(format!(
                        "integration {} outside {} available",
                        index,
                        data.len_of(Axis(0))
                    )));
                }
                let sample = data.index_axis(Axis(0), index);
                let real: Vec<f64> = sample.iter().map(|v| v.re as f64).collect();
                let sig = StatsHelper::mad_to_std(&real)
                    / ((real.len() * state.dtarr[dtind]) as f64).sqrt();
                info!("Setting mock amp as {}*{}={}", snr, sig, snr * sig);
                snr * sig
            }
        };

        let (l, m) = overrides.lm.unwrap_or_else(|| {
            let offset = rng.gen_range(-halffield..halffield);
            if rng.gen_bool(0.5) {
                (offset, 0.0)
            } else {
                (0.0, offset)
            }
        });

        mocks.push(SimulatedTransient {
            segment,
            integration,
            dm,
            dt,
            amp,
            l,
            m,
        });
    }
    Ok(mocks)
}

/// Simulated visibilities for one segment: complex Gaussian noise plus
/// every configured transient that falls in it.
pub fn read_segment<R: Rng + ?Sized>(
    state: &State,
    segment: usize,
    rng: &mut R,
) -> StageResult<Visibilities> {
    state.segment_bounds(segment)?;
    let noise = Normal::new(0.0f32, state.prefs.sim_noise as f32)
        .map_err(|err| StageError::Config(format!("sim_noise: {}", err)))?;

    let mut data = Array4::from_shape_simple_fn(state.datashape(), || {
        Complex32::new(noise.sample(&mut *rng), noise.sample(&mut *rng))
    });

    let transients: Vec<&SimulatedTransient> = state
        .prefs
        .simulated_transient
        .iter()
        .filter(|tr| tr.segment == segment)
        .collect();
    if transients.is_empty() {
        return Ok(data);
    }

    let uvw = state.get_uvw_segment(segment)?;
    for tr in transients {
        info!(
            "Injecting transient at int {} with DM {}, dt {}, amp {} and (l, m) = ({}, {})",
            tr.integration, tr.dm, tr.dt, tr.amp, tr.l, tr.m
        );
        let model = make_transient_data(state, tr.amp, tr.integration, tr.dm, tr.dt, 0.0);
        for ((i, j, k, _), value) in data.indexed_iter_mut() {
            let pulse = model[[k, i]];
            if pulse.re == 0.0 {
                continue;
            }
            let phase = 2.0 * PI * (tr.l * uvw.u[[j, k]] as f64 + tr.m * uvw.v[[j, k]] as f64);
            *value += pulse * Complex32::from_polar(1.0, phase as f32);
        }
    }
    Ok(data)
}

pub fn data_prep(state: &State, mut data: Visibilities) -> StageResult<Visibilities> {
    flag_channels(data.view_mut(), &state.prefs.flaglist)?;
    meantsub(data.view_mut());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{mock_state, Preferences};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn undispersed_pulse_fills_single_integration() {
        let state = mock_state(Preferences::default());
        let model = make_transient_data(&state, 2.0, 10.0, 0.0, state.inttime(), 0.0);
        assert_eq!(model.dim(), (state.nchan(), state.readints()));
        for k in 0..state.nchan() {
            assert_eq!(model[[k, 10]], Complex32::new(2.0, 0.0));
            assert_eq!(model[[k, 11]], Complex32::new(0.0, 0.0));
        }
    }

    #[test]
    fn offset_pulse_splits_between_integrations() {
        let state = mock_state(Preferences::default());
        let model = make_transient_data(&state, 1.0, 10.25, 0.0, state.inttime(), 0.0);
        assert!((model[[0, 10]].re - 0.75).abs() < 1e-6);
        assert!((model[[0, 11]].re - 0.25).abs() < 1e-6);

        let wide = make_transient_data(&state, 1.0, 10.75, 0.0, 1.5 * state.inttime(), 0.0);
        let total: f32 = wide.row(0).iter().map(|v| v.re).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(wide[[0, 12]].re > 0.0);
    }

    #[test]
    fn broadened_or_zero_width_channels_are_skipped() {
        let state = mock_state(Preferences::default());
        let broad = make_transient_data(&state, 1.0, 10.0, 0.0, 5.0 * state.inttime(), 0.0);
        assert_eq!(broad.dim(), (state.nchan(), state.readints()));
        assert!(broad.iter().all(|v| v.re == 0.0 && v.im == 0.0));

        let zero_width = make_transient_data(&state, 1.0, 10.0, 0.0, 0.0, 0.0);
        assert!(zero_width.iter().all(|v| v.re == 0.0));
    }

    #[test]
    fn dispersion_delays_low_channels_and_slope_ramps_amplitude() {
        let state = mock_state(Preferences::default());
        let delays = calc_delay2(&state.freq, state.freq[state.nchan() - 1], 200.0);
        let model = make_transient_data(&state, 1.0, 5.0, 200.0, state.inttime(), 1.0);
        let last = state.nchan() - 1;
        let first_peak = model
            .row(0)
            .iter()
            .position(|v| v.re > 0.0)
            .unwrap();
        assert_eq!(first_peak, (5.0 + delays[0] / state.inttime()).floor() as usize);
        let total_last: f32 = model.row(last).iter().map(|v| v.re).sum();
        assert!((total_last - 2.0).abs() < 1e-6);
    }

    #[test]
    fn params_respect_overrides_and_field() {
        let state = mock_state(Preferences::default());
        let mut rng = StdRng::seed_from_u64(3);
        let overrides = TransientOverrides {
            amp: Some(0.3),
            ..Default::default()
        };
        let mocks = make_transient_params(&state, 5, &overrides, None, &mut rng).unwrap();
        assert_eq!(mocks.len(), 5);
        let halffield = state.fieldsize_deg().to_radians() / 2.0;
        for mock in &mocks {
            assert_eq!(mock.amp, 0.3);
            assert_eq!(mock.dm, 0.0);
            assert!(mock.l == 0.0 || mock.m == 0.0);
            assert!(mock.l.abs() <= halffield && mock.m.abs() <= halffield);
            assert!((mock.integration as usize) < state.readints());
        }
    }

    #[test]
    fn params_scale_amplitude_to_data_noise() {
        let state = mock_state(Preferences::default());
        let mut rng = StdRng::seed_from_u64(5);
        let data = read_segment(&state, 0, &mut rng).unwrap();
        let overrides = TransientOverrides {
            integration: Some(20.0),
            snr: Some(10.0),
            ..Default::default()
        };
        let mocks = make_transient_params(&state, 1, &overrides, Some(&data), &mut rng).unwrap();
        let npts = (state.nbl() * state.nchan() * state.npol()) as f64;
        let expected = 10.0 / npts.sqrt();
        assert!((mocks[0].amp / expected - 1.0).abs() < 0.1, "amp {}", mocks[0].amp);
    }

    #[test]
    fn read_segment_injects_configured_transient() {
        let mut state = mock_state(Preferences {
            sim_noise: 0.0,
            ..Default::default()
        });
        state.prefs.simulated_transient = vec![SimulatedTransient {
            segment: 0,
            integration: 30.0,
            dm: 0.0,
            dt: state.inttime(),
            amp: 1.0,
            l: 0.0,
            m: 0.0,
        }];
        let mut rng = StdRng::seed_from_u64(1);
        let data = read_segment(&state, 0, &mut rng).unwrap();
        assert_eq!(data.dim(), state.datashape());
        assert!(data
            .index_axis(Axis(0), 30)
            .iter()
            .all(|v| (v.re - 1.0).abs() < 1e-6));
        assert!(data.index_axis(Axis(0), 29).iter().all(|v| v.norm() == 0.0));
        assert!(read_segment(&state, 5, &mut rng).is_err());
    }

    #[test]
    fn data_prep_flags_and_centres() {
        let state = mock_state(Preferences {
            flaglist: vec![2],
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(9);
        let data = data_prep(&state, read_segment(&state, 0, &mut rng).unwrap()).unwrap();
        assert!(data
            .slice(ndarray::s![.., .., 2, ..])
            .iter()
            .all(|v| v.norm() == 0.0));
        let series: Vec<f64> = data
            .slice(ndarray::s![.., 0, 0, 0])
            .iter()
            .map(|v| v.re as f64)
            .collect();
        assert!(StatsHelper::mean(&series).abs() < 1e-4);
    }
}
