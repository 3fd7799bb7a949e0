use log::{debug, info};
use ndarray::{s, Array2, ArrayView4, Axis};
use num_complex::Complex32;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustfft::num_traits::Zero;

use crate::interface::candidate::{calc_features, CandCollection, CandData, CandLocation};
use crate::math::fft::ImagePlan;
use crate::math::geometry::Uvw;
use crate::math::stats::StatsHelper;
use crate::prelude::{
    ProcessingStage, StageError, StageInput, StageMetadata, StageOutput, StageResult,
};
use crate::processing::buffer_pool::GridPool;
use crate::processing::calibrate::phase_shift;
use crate::processing::dedisperse::{calc_delay, dedisperse_resample};
use crate::processing::grid::{grid_cells, grid_integration};
use crate::processing::kalman::{kalman_prepare_coeffs, kalman_significance, KalmanCoeffs};
use crate::state::{SearchType, State};
use crate::telemetry::log::LogManager;

pub struct SearchResources {
    pub plan: ImagePlan,
    pub pool: GridPool,
    pub rng: StdRng,
}

impl SearchResources {
    pub fn new(state: &State) -> Self {
        Self {
            plan: ImagePlan::new(state.npixx, state.npixy),
            pool: GridPool::with_capacity(1),
            rng: StdRng::seed_from_u64(state.prefs.seed),
        }
    }
}

pub fn grid_image(
    data: ArrayView4<Complex32>,
    uvw: &Uvw,
    uvres: f64,
    resources: &mut SearchResources,
    integrations: &[usize],
) -> StageResult<Vec<Array2<f32>>> {
    let (npixx, npixy) = resources.plan.shape();
    let cells = grid_cells(uvw, npixx, npixy, uvres);
    integrations
        .iter()
        .map(|&i| image_integration(data, &cells, resources, i))
        .collect()
}

fn image_integration(
    data: ArrayView4<Complex32>,
    cells: &Array2<Option<(usize, usize)>>,
    resources: &mut SearchResources,
    integration: usize,
) -> StageResult<Array2<f32>> {
    if integration >= data.len_of(Axis(0)) {
        return Err(StageError::InvalidInput(format!(
            "integration {} outside {} available",
            integration,
            data.len_of(Axis(0))
        )));
    }
    let (npixx, npixy) = resources.plan.shape();
    let buffer = resources.pool.checkout(npixx * npixy)?;
    let mut grid = Array2::from_shape_vec((npixx, npixy), buffer)
        .map_err(|err| StageError::Internal(err.to_string()))?;
    grid_integration(data.index_axis(Axis(0), integration), cells, grid.view_mut())?;
    let image = resources.plan.image(&mut grid);
    resources.pool.release(grid.into_raw_vec());
    image
}

fn image_peak(image: &Array2<f32>) -> ((usize, usize), f32) {
    image
        .indexed_iter()
        .fold(((0, 0), f32::NEG_INFINITY), |best, (pix, &value)| {
            if value > best.1 {
                (pix, value)
            } else {
                best
            }
        })
}

// (nint, nchan) real part averaged over baselines and polarisations
fn mean_spectra(data: ArrayView4<Complex32>) -> Array2<f64> {
    let (nint, nbl, nchan, npol) = data.dim();
    let norm = (nbl * npol).max(1) as f64;
    Array2::from_shape_fn((nint, nchan), |(i, k)| {
        data.slice(s![i, .., k, ..])
            .iter()
            .map(|v| v.re as f64)
            .sum::<f64>()
            / norm
    })
}

// Flagged channels have zero noise and are left out of the filter.
struct KalmanModel {
    chans: Vec<usize>,
    spec_std: Vec<f64>,
    coeffs: KalmanCoeffs,
}

impl KalmanModel {
    fn prepare(
        data: ArrayView4<Complex32>,
        n_trial: usize,
        rng: &mut StdRng,
    ) -> StageResult<Self> {
        let nint = data.len_of(Axis(0));
        let noff = 10.max(nint / 10).min(nint);
        let offints = rand::seq::index::sample(rng, nint, noff).into_vec();
        let spectra = mean_spectra(data);

        let (chans, spec_std): (Vec<usize>, Vec<f64>) = (0..spectra.ncols())
            .map(|k| {
                let column: Vec<f64> = offints.iter().map(|&i| spectra[[i, k]]).collect();
                (k, StatsHelper::std(&column))
            })
            .filter(|(_, std)| *std > 0.0)
            .unzip();
        if chans.is_empty() {
            return Err(StageError::InvalidInput(
                "no channel has measurable noise for the Kalman filter".into(),
            ));
        }

        let coeffs = kalman_prepare_coeffs(&spec_std, None, n_trial, rng)?;
        Ok(Self {
            chans,
            spec_std,
            coeffs,
        })
    }

    fn significance(
        &self,
        data: ArrayView4<Complex32>,
        uvw: &Uvw,
        integration: usize,
        l: f64,
        m: f64,
    ) -> StageResult<f64> {
        let mut spec = data.slice(s![integration..integration + 1, .., .., ..]).to_owned();
        phase_shift(spec.view_mut(), uvw, l, m, None)?;
        let spectrum = mean_spectra(spec.view());
        let selected: Vec<f64> = self.chans.iter().map(|&k| spectrum[[0, k]]).collect();
        Ok(kalman_significance(&selected, &self.spec_std, &self.coeffs))
    }
}

/// Images each integration of dedispersed, resampled `data` and keeps those
/// above `sigma_image1` (and `sigma_kalman` for `image1k`).
pub fn search_thresh(
    state: &State,
    segment: usize,
    data: ArrayView4<Complex32>,
    dmind: usize,
    dtind: usize,
    integrations: Option<Vec<usize>>,
    resources: &mut SearchResources,
) -> StageResult<CandCollection> {
    let mut collection = CandCollection::for_state(state);
    if data.iter().all(|v| v.is_zero()) {
        info!("Data is all zeros. Skipping search.");
        return Ok(collection);
    }

    let integrations =
        integrations.unwrap_or_else(|| state.get_search_ints(segment, dmind, dtind));
    let nint = data.len_of(Axis(0));
    if let Some(&bad) = integrations.iter().find(|&&i| i >= nint) {
        return Err(StageError::InvalidInput(format!(
            "integration {} outside {} available",
            bad, nint
        )));
    }
    let (Some(&minint), Some(&maxint)) = (integrations.iter().min(), integrations.iter().max())
    else {
        return Ok(collection);
    };

    let kalman = match state.prefs.searchtype {
        SearchType::Image1k => Some(KalmanModel::prepare(
            data,
            state.prefs.kalman_trials,
            &mut resources.rng,
        )?),
        SearchType::Image1 => None,
    };

    let (Some(&dm), Some(&dt)) = (state.dmarr.get(dmind), state.dtarr.get(dtind)) else {
        return Err(StageError::InvalidInput(format!(
            "trial (dmind, dtind) = ({}, {}) outside the search grid",
            dmind, dtind
        )));
    };
    info!(
        "{:?} search of {} ints ({}-{}) in seg {} at DM/dt {:.1}/{} with image {}x{} (uvres {})",
        state.prefs.searchtype,
        integrations.len(),
        minint,
        maxint,
        segment,
        dm,
        dt,
        state.npixx,
        state.npixy,
        state.uvres
    );

    let uvw = state.get_uvw_segment(segment)?;
    let (npixx, npixy) = resources.plan.shape();
    let cells = grid_cells(&uvw, npixx, npixy, state.uvres);
    let half_window = state.prefs.timewindow / 2;

    let mut canddatalist: Vec<CandData> = Vec::new();
    for &integration in &integrations {
        let image = image_integration(data, &cells, resources, integration)?;
        let (peak_pix, peak) = image_peak(&image);
        let pixels: Vec<f64> = image.iter().map(|&v| v as f64).collect();
        let noise = StatsHelper::mad_to_std(&pixels);
        if noise <= 0.0 {
            debug!("Image of int {} has no measurable noise", integration);
            continue;
        }
        let snr1 = peak as f64 / noise;
        if snr1 <= state.prefs.sigma_image1 {
            continue;
        }

        let loc = CandLocation {
            segment,
            integration,
            dmind,
            dtind,
            beamnum: 0,
        };
        let (l1, m1) = state.pixtolm(peak_pix);

        let snrk = match &kalman {
            Some(model) => {
                let significance_kalman = model.significance(data, &uvw, integration, l1, m1)?;
                let significance_image = -StatsHelper::norm_logsf(snr1);
                let total = (2.0 * (significance_kalman + significance_image)).max(0.0).sqrt();
                if total <= state.prefs.sigma_kalman {
                    continue;
                }
                info!(
                    "Got one! SNR1 {:.1} and SNRk {:.1} candidate at {:?} and (l, m) = ({}, {})",
                    snr1, total, loc, l1, m1
                );
                Some(total)
            }
            None => {
                info!(
                    "Got one! SNR1 {:.1} candidate at {:?} and (l, m) = ({}, {})",
                    snr1, loc, l1, m1
                );
                None
            }
        };

        let start = integration.saturating_sub(half_window);
        let stop = (integration + half_window).min(nint).max(integration + 1);
        let mut window = data.slice(s![start..stop, .., .., ..]).to_owned();
        phase_shift(window.view_mut(), &uvw, l1, m1, None)?;
        let nbl = window.len_of(Axis(1)).max(1) as f32;
        let phased = window.sum_axis(Axis(1)).mapv(|v| v / nbl);

        canddatalist.push(CandData {
            loc,
            dm,
            dt: state.inttime() * dt as f64,
            image,
            data: phased,
            window_offset: integration - start,
            snr1,
            snrk,
            l1,
            m1,
        });

        let accumulated = canddatalist.iter().map(CandData::nbytes).sum::<usize>() as f64 / 1e9;
        if accumulated > state.prefs.memory_limit {
            info!(
                "Accumulated CandData size is {:.1} GB, which exceeds memory limit of {:.1}. \
                 Running calc_features...",
                accumulated, state.prefs.memory_limit
            );
            collection += calc_features(&canddatalist);
            canddatalist.clear();
        }
    }
    collection += calc_features(&canddatalist);

    info!(
        "{} candidates returned for (seg, dmind, dtind) = ({}, {}, {})",
        collection.len(),
        segment,
        dmind,
        dtind
    );
    Ok(collection)
}

pub fn dedisperse_image(
    state: &State,
    segment: usize,
    data: ArrayView4<Complex32>,
    resources: &mut SearchResources,
) -> StageResult<CandCollection> {
    let freq_max = state.freq.iter().cloned().fold(f64::MIN, f64::max);
    let mut collection = CandCollection::for_state(state);
    for (dtind, &dt) in state.dtarr.iter().enumerate() {
        for (dmind, &dm) in state.dmarr.iter().enumerate() {
            let delay = calc_delay(&state.freq, freq_max, dm, state.inttime());
            let data_corr = dedisperse_resample(data, &delay, dt)?;
            collection += search_thresh(
                state,
                segment,
                data_corr.view(),
                dmind,
                dtind,
                None,
                resources,
            )?;
        }
    }
    info!(
        "{} candidates returned for seg {}",
        collection.len(),
        segment
    );
    Ok(collection)
}

pub struct ImageSearchStage {
    state: Option<State>,
    resources: Option<SearchResources>,
    logger: LogManager,
}

impl ImageSearchStage {
    pub fn new() -> Self {
        Self {
            state: None,
            resources: None,
            logger: LogManager::new("search"),
        }
    }
}

impl Default for ImageSearchStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingStage for ImageSearchStage {
    fn initialize(&mut self, state: &State) -> StageResult<()> {
        self.resources = Some(SearchResources::new(state));
        self.state = Some(state.clone());
        self.logger.detail(&format!(
            "{} dm x {} dt trials on {}x{} images",
            state.dmarr.len(),
            state.dtarr.len(),
            state.npixx,
            state.npixy
        ));
        Ok(())
    }

    fn execute(&mut self, input: StageInput) -> StageResult<StageOutput> {
        let (Some(state), Some(resources)) = (self.state.as_ref(), self.resources.as_mut()) else {
            return Err(StageError::Internal("stage not initialized".into()));
        };

        let collection = dedisperse_image(state, input.segment, input.data.view(), resources)?;
        let note = match collection.max_snr1() {
            Some(peak) => format!("{} candidates, peak snr1 {:.1}", collection.len(), peak),
            None => "no candidates".to_string(),
        };
        self.logger
            .record(&format!("segment {}: {}", input.segment, note));

        Ok(StageOutput {
            data: input.data,
            metadata: StageMetadata {
                candidates: Some(collection),
                notes: vec![note],
            },
        })
    }

    fn cleanup(&mut self) {
        if let Some(resources) = self.resources.as_mut() {
            resources.pool.reset();
        }
        self.resources = None;
        self.state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{mock_state, Preferences};
    use ndarray::Array4;

    fn point_source(state: &State, integration: usize, amp: f32) -> ndarray::Array4<Complex32> {
        let mut data = Array4::<Complex32>::zeros(state.datashape());
        // faint, structureless background so the image noise is measurable
        for ((i, j, k, l), value) in data.indexed_iter_mut() {
            let phase = 0.7 * (i * 31 + j * 17 + k * 7 + l * 3) as f32;
            *value = Complex32::from_polar(0.05, phase);
        }
        data.slice_mut(s![integration, .., .., ..])
            .mapv_inplace(|v| v + Complex32::new(amp, 0.0));
        data
    }

    #[test]
    fn peak_and_spectra_helpers() {
        let mut image = Array2::<f32>::zeros((3, 3));
        image[[2, 1]] = 4.0;
        assert_eq!(image_peak(&image), ((2, 1), 4.0));

        let data = Array4::from_elem((2, 2, 3, 2), Complex32::new(1.5, -1.0));
        let spectra = mean_spectra(data.view());
        assert_eq!(spectra.dim(), (2, 3));
        assert!(spectra.iter().all(|v| (v - 1.5).abs() < 1e-12));
    }

    #[test]
    fn point_source_is_found_at_phase_centre() {
        let state = mock_state(Preferences {
            sigma_image1: 6.0,
            ..Default::default()
        });
        let mut resources = SearchResources::new(&state);
        let data = point_source(&state, 40, 1.0);

        let collection =
            search_thresh(&state, 0, data.view(), 0, 0, None, &mut resources).unwrap();
        let hit = collection
            .iter()
            .find(|record| record.loc.integration == 40)
            .expect("injected integration detected");
        assert_eq!((hit.l1, hit.m1), (0.0, 0.0));
        assert!(hit.snr1 > 6.0);
        assert!(hit.snrk.is_none());
    }

    #[test]
    fn explicit_integrations_limit_search() {
        let state = mock_state(Preferences {
            sigma_image1: 6.0,
            ..Default::default()
        });
        let mut resources = SearchResources::new(&state);
        let data = point_source(&state, 40, 1.0);

        let skipped =
            search_thresh(&state, 0, data.view(), 0, 0, Some(vec![10, 11]), &mut resources)
                .unwrap();
        assert!(skipped.iter().all(|r| r.loc.integration != 40));

        let empty =
            search_thresh(&state, 0, data.view(), 0, 0, Some(Vec::new()), &mut resources)
                .unwrap();
        assert!(empty.is_empty());

        assert!(search_thresh(&state, 0, data.view(), 0, 0, Some(vec![500]), &mut resources)
            .is_err());
    }

    #[test]
    fn kalman_search_reports_combined_significance() {
        use crate::source::{data_prep, read_segment};
        use crate::state::SimulatedTransient;
        use rand::rngs::StdRng;

        let mut state = mock_state(Preferences {
            searchtype: SearchType::Image1k,
            sigma_image1: 6.0,
            sigma_kalman: 6.0,
            kalman_trials: 2000,
            ..Default::default()
        });
        state.prefs.simulated_transient = vec![SimulatedTransient {
            segment: 0,
            integration: 60.0,
            dm: 0.0,
            dt: state.inttime(),
            amp: 3.0,
            l: 0.0,
            m: 0.0,
        }];
        let mut rng = StdRng::seed_from_u64(21);
        let data = data_prep(&state, read_segment(&state, 0, &mut rng).unwrap()).unwrap();
        let mut resources = SearchResources::new(&state);

        let collection =
            search_thresh(&state, 0, data.view(), 0, 0, None, &mut resources).unwrap();
        let hit = collection
            .iter()
            .find(|record| record.loc.integration == 60)
            .expect("injected integration detected");
        let snrk = hit.snrk.expect("kalman significance recorded");
        assert!(snrk > 6.0);
    }

    #[test]
    fn memory_limited_flush_keeps_every_candidate() {
        let mut state = mock_state(Preferences {
            sigma_image1: 6.0,
            ..Default::default()
        });
        let data = point_source(&state, 40, 1.0);
        let unlimited = search_thresh(
            &state,
            0,
            data.view(),
            0,
            0,
            None,
            &mut SearchResources::new(&state),
        )
        .unwrap();

        state.prefs.memory_limit = 1e-12;
        let flushed = search_thresh(
            &state,
            0,
            data.view(),
            0,
            0,
            None,
            &mut SearchResources::new(&state),
        )
        .unwrap();
        assert_eq!(flushed.len(), unlimited.len());
        assert!(flushed.iter().any(|record| record.loc.integration == 40));
        assert_eq!(flushed.prefs.as_ref().unwrap().memory_limit, 1e-12);
        assert_eq!(flushed.summary.as_ref().unwrap().scan, state.metadata.scan);
    }

    #[test]
    fn zero_data_skips_search() {
        let state = mock_state(Preferences::default());
        let mut resources = SearchResources::new(&state);
        let data = Array4::<Complex32>::zeros(state.datashape());
        let collection =
            search_thresh(&state, 0, data.view(), 0, 0, None, &mut resources).unwrap();
        assert!(collection.is_empty());
    }

    #[test]
    fn grid_image_returns_one_image_per_integration() {
        let state = mock_state(Preferences::default());
        let mut resources = SearchResources::new(&state);
        let data = point_source(&state, 3, 1.0);
        let uvw = state.get_uvw_segment(0).unwrap();
        let images = grid_image(data.view(), &uvw, state.uvres, &mut resources, &[2, 3]).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].dim(), (state.npixx, state.npixy));
        let (pix, _) = image_peak(&images[1]);
        assert_eq!(pix, (state.npixx / 2, state.npixy / 2));
        assert_eq!(resources.pool.available(), 1);
    }

    #[test]
    fn stage_requires_initialization() {
        let state = mock_state(Preferences::default());
        let mut stage = ImageSearchStage::new();
        let data = Array4::<Complex32>::zeros(state.datashape());
        assert!(stage.execute(StageInput::new(data.clone(), 0)).is_err());

        stage.initialize(&state).unwrap();
        let output = stage.execute(StageInput::new(data, 0)).unwrap();
        assert_eq!(output.metadata.notes, vec!["no candidates".to_string()]);
        stage.cleanup();
    }
}
