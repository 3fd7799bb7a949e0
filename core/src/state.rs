//! Search configuration: user preferences plus everything derived from them
//! and the scan metadata (DM grid, image size, segmentation, memory use).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::interface::metadata::Metadata;
use crate::math::geometry::{calc_uvw, Uvw};
use crate::prelude::{StageError, StageResult};
use crate::processing::dedisperse::{calc_delay, calc_delay2, calc_dmarr};

const SECONDS_PER_DAY: f64 = 86_400.0;
const EARTH_ROTATION_RATE: f64 = 7.292_115e-5;
const BYTES_PER_VISIBILITY: f64 = 8.0;
const MAX_SEGMENT_ITERATIONS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Threshold on image signal-to-noise only.
    #[default]
    Image1,
    /// Image threshold followed by a Kalman spectral-smoothness filter.
    Image1k,
}

/// Transient injected into simulated data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedTransient {
    pub segment: usize,
    /// Integration of the pulse at the highest frequency, relative to the
    /// segment start.
    pub integration: f64,
    /// Dispersion measure in pc/cm3.
    pub dm: f64,
    /// Pulse width in seconds.
    pub dt: f64,
    pub amp: f64,
    pub l: f64,
    pub m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Channel selection (indices into the original channel list).
    pub chans: Option<Vec<usize>>,
    /// Selected channels to zero before searching.
    pub flaglist: Vec<usize>,
    pub maxdm: f64,
    pub mindm: f64,
    pub dm_maxloss: f64,
    /// Assumed intrinsic pulse width in microseconds.
    pub dm_pulsewidth: f64,
    pub dtarr: Vec<usize>,
    pub npix_max: Option<usize>,
    pub npixx: Option<usize>,
    pub npixy: Option<usize>,
    pub uvres: Option<f64>,
    pub uvoversample: f64,
    pub fringetime: Option<f64>,
    pub sigma_image1: f64,
    pub sigma_kalman: f64,
    pub kalman_trials: usize,
    pub searchtype: SearchType,
    pub timewindow: usize,
    /// Memory budget in GB for a single segment.
    pub memory_limit: f64,
    pub nthread: usize,
    pub nsegment: Option<usize>,
    pub simulated_transient: Vec<SimulatedTransient>,
    pub savecands: bool,
    pub candsfile: Option<PathBuf>,
    pub seed: u64,
    /// Standard deviation of simulated noise per real/imaginary part.
    pub sim_noise: f64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            chans: None,
            flaglist: Vec::new(),
            maxdm: 0.0,
            mindm: 0.0,
            dm_maxloss: 0.05,
            dm_pulsewidth: 3000.0,
            dtarr: vec![1],
            npix_max: None,
            npixx: None,
            npixy: None,
            uvres: None,
            uvoversample: 1.0,
            fringetime: None,
            sigma_image1: 7.0,
            sigma_kalman: 7.0,
            kalman_trials: 10_000,
            searchtype: SearchType::Image1,
            timewindow: 30,
            memory_limit: 16.0,
            nthread: 1,
            nsegment: None,
            simulated_transient: Vec::new(),
            savecands: false,
            candsfile: None,
            seed: 0,
            sim_noise: 1.0,
        }
    }
}

/// Smallest `2^i * 3^j` strictly larger than `range`.
fn calc_npix(range: f64) -> usize {
    let mut best: Option<usize> = None;
    for i in 0..14u32 {
        for j in 0..10u32 {
            let npix = 2usize.pow(i) * 3usize.pow(j);
            if npix as f64 > range && best.map_or(true, |b| npix < b) {
                best = Some(npix);
            }
        }
    }
    best.unwrap_or(2usize.pow(13) * 3usize.pow(9))
}

#[derive(Debug, Clone)]
pub struct State {
    pub metadata: Metadata,
    pub prefs: Preferences,
    /// Selected original channel indices.
    pub chans: Vec<usize>,
    /// Selected channel frequencies in GHz.
    pub freq: Vec<f64>,
    pub dmarr: Vec<f64>,
    pub dtarr: Vec<usize>,
    /// Largest integration delay for each DM in `dmarr`.
    pub dmshifts: Vec<usize>,
    /// Largest dispersion delay at the highest DM, in seconds.
    pub t_overlap: f64,
    pub uvres: f64,
    pub npixx: usize,
    pub npixy: usize,
    pub fringetime: f64,
    /// Segment boundaries as `[start, stop)` integration indices.
    segments: Vec<(usize, usize)>,
}

impl State {
    pub fn new(metadata: Metadata, prefs: Preferences) -> StageResult<Self> {
        metadata.validate()?;
        let freq_orig = metadata.freq_orig();

        let chans = match &prefs.chans {
            Some(chans) if chans.is_empty() => {
                return Err(StageError::Config("channel selection is empty".into()))
            }
            Some(chans) => chans.clone(),
            None => (0..freq_orig.len()).collect(),
        };
        if let Some(&bad) = chans.iter().find(|&&ch| ch >= freq_orig.len()) {
            return Err(StageError::Config(format!(
                "channel {} outside {} available",
                bad,
                freq_orig.len()
            )));
        }
        let freq: Vec<f64> = chans.iter().map(|&ch| freq_orig[ch]).collect();

        if prefs.dtarr.is_empty() || prefs.dtarr.contains(&0) {
            return Err(StageError::Config(format!(
                "dtarr {:?} must be non-empty and positive",
                prefs.dtarr
            )));
        }
        if prefs.maxdm < prefs.mindm || prefs.mindm < 0.0 {
            return Err(StageError::Config(format!(
                "DM range {}..{} is invalid",
                prefs.mindm, prefs.maxdm
            )));
        }

        let inttime = metadata.inttime;
        let dmarr = calc_dmarr(&prefs, inttime, &freq, metadata.spw_chansize[0]);
        let freq_max = freq.iter().cloned().fold(f64::MIN, f64::max);
        let freq_min = freq.iter().cloned().fold(f64::MAX, f64::min);
        let dmshifts: Vec<usize> = dmarr
            .iter()
            .map(|&dm| {
                calc_delay(&freq, freq_max, dm, inttime)
                    .into_iter()
                    .max()
                    .unwrap_or(0)
            })
            .collect();
        let dm_top = dmarr.iter().cloned().fold(0.0, f64::max);
        let t_overlap = calc_delay2(&freq, freq_max, dm_top)
            .into_iter()
            .fold(0.0, f64::max);

        let uvres = match prefs.uvres {
            Some(uvres) if uvres > 0.0 => uvres,
            Some(uvres) => {
                return Err(StageError::Config(format!("uvres {} must be positive", uvres)))
            }
            None => (metadata.dishdiameter / (0.299_792_458 / freq_min) / 2.0)
                .round()
                .max(1.0),
        };

        let (ur, vr, wr) = calc_uvw(
            metadata.starttime_mjd,
            metadata.radec,
            &metadata.antpos,
            metadata.latitude,
            metadata.longitude,
        );
        let (umax, vmax) = Uvw::from_metres(&ur, &vr, &wr, &freq).max_extent();
        let cap = |npix: usize| prefs.npix_max.map_or(npix, |max| npix.min(max));
        let npixx = prefs
            .npixx
            .unwrap_or_else(|| cap(calc_npix(prefs.uvoversample * 2.0 * umax as f64 / uvres)));
        let npixy = prefs
            .npixy
            .unwrap_or_else(|| cap(calc_npix(prefs.uvoversample * 2.0 * vmax as f64 / uvres)));

        let fringetime = prefs.fringetime.unwrap_or_else(|| {
            uvres / (EARTH_ROTATION_RATE * (umax.max(vmax) as f64).max(1.0))
        });

        let mut state = Self {
            metadata,
            prefs,
            chans,
            freq,
            dmarr,
            dtarr: Vec::new(),
            dmshifts,
            t_overlap,
            uvres,
            npixx,
            npixy,
            fringetime,
            segments: Vec::new(),
        };
        state.dtarr = state.prefs.dtarr.clone();

        state.segments = state.calc_segment_times(1.0)?;
        if let Some(requested) = state.prefs.nsegment {
            if requested > state.nsegment() {
                let scale = requested as f64 / state.nsegment() as f64;
                state.segments = state.calc_segment_times(scale)?;
            }
        }
        if state.memory_total() > state.prefs.memory_limit {
            state.find_segment_times()?;
        }

        Ok(state)
    }

    pub fn inttime(&self) -> f64 {
        self.metadata.inttime
    }

    pub fn nints(&self) -> usize {
        self.metadata.nints
    }

    pub fn nchan(&self) -> usize {
        self.freq.len()
    }

    pub fn npol(&self) -> usize {
        self.metadata.npol
    }

    pub fn nbl(&self) -> usize {
        self.metadata.nbl()
    }

    pub fn nsegment(&self) -> usize {
        self.segments.len()
    }

    /// Integrations read per segment.
    pub fn readints(&self) -> usize {
        self.segments
            .first()
            .map(|(start, stop)| stop - start)
            .unwrap_or(0)
    }

    pub fn datashape(&self) -> (usize, usize, usize, usize) {
        (self.readints(), self.nbl(), self.nchan(), self.npol())
    }

    pub fn segment_bounds(&self, segment: usize) -> StageResult<(usize, usize)> {
        self.segments.get(segment).copied().ok_or_else(|| {
            StageError::InvalidInput(format!(
                "segment {} outside {} segments",
                segment,
                self.nsegment()
            ))
        })
    }

    /// Segment `(start, stop)` times in MJD.
    pub fn segmenttimes(&self) -> Vec<(f64, f64)> {
        let to_mjd = |ints: usize| {
            self.metadata.starttime_mjd + ints as f64 * self.inttime() / SECONDS_PER_DAY
        };
        self.segments
            .iter()
            .map(|&(start, stop)| (to_mjd(start), to_mjd(stop)))
            .collect()
    }

    pub fn fieldsize_deg(&self) -> f64 {
        (1.0 / (2.0 * self.uvres)).to_degrees()
    }

    /// Integrations shared by consecutive segments: the largest applied shift.
    fn overlap_ints(&self) -> usize {
        self.dmshifts.iter().copied().max().unwrap_or(0)
    }

    fn memory_for(&self, readints: usize) -> f64 {
        let vismem = readints as f64
            * (self.nbl() * self.nchan() * self.npol()) as f64
            * BYTES_PER_VISIBILITY
            / 1e9;
        let dtmin = self.dtarr.iter().copied().min().unwrap_or(1);
        let immem = self.prefs.nthread.max(1) as f64
            * (readints / dtmin) as f64
            * (self.npixx * self.npixy) as f64
            * BYTES_PER_VISIBILITY
            / 1e9;
        vismem + immem
    }

    /// Visibility memory in GB for one segment.
    pub fn vismem(&self) -> f64 {
        self.readints() as f64 * (self.nbl() * self.nchan() * self.npol()) as f64
            * BYTES_PER_VISIBILITY
            / 1e9
    }

    /// Image memory in GB for one segment.
    pub fn immem(&self) -> f64 {
        self.memory_total() - self.vismem()
    }

    pub fn memory_total(&self) -> f64 {
        self.memory_for(self.readints())
    }

    /// Memory needed by the shortest possible segment.
    pub fn memory_total_limit(&self) -> f64 {
        self.memory_for(self.overlap_ints() + 1)
    }

    /// Splits the scan into overlapping segments. The step is bounded by the
    /// fringe time and divided by `scale_nsegment`; consecutive segments
    /// overlap by the maximum dispersion delay.
    pub fn calc_segment_times(&self, scale_nsegment: f64) -> StageResult<Vec<(usize, usize)>> {
        let nints = self.nints();
        let overlap = self.overlap_ints();
        if overlap >= nints || self.fringetime <= self.inttime() {
            return Err(StageError::Config(format!(
                "could not set segment times: confirm t_overlap < scan length ({} < {}) \
                 and fringetime > inttime ({} > {})",
                self.t_overlap,
                nints as f64 * self.inttime(),
                self.fringetime,
                self.inttime()
            )));
        }

        let available = nints - overlap;
        let natural = ((self.fringetime / self.inttime()).round() as usize).min(available);
        let step = ((natural as f64 / scale_nsegment.max(1.0)).floor() as usize).clamp(1, available);

        let mut segments = Vec::new();
        let mut stop = overlap + step;
        while stop <= nints {
            let start = segments
                .last()
                .map(|&(_, previous_stop): &(usize, usize)| previous_stop - overlap)
                .unwrap_or(0);
            segments.push((start, stop));
            stop += step;
        }
        Ok(segments)
    }

    /// Shrinks segments until one fits within `memory_limit`.
    pub fn find_segment_times(&mut self) -> StageResult<()> {
        let limit = self.prefs.memory_limit;
        if self.memory_total_limit() >= limit {
            return Err(StageError::Config(format!(
                "memory_limit of {} GB is smaller than best solution of {} GB; \
                 try lowering maxdm or image size",
                limit,
                self.memory_total_limit()
            )));
        }

        log::debug!(
            "Total memory of {:.3} GB is over limit of {:.3} GB with {} segments",
            self.memory_total(),
            limit,
            self.nsegment()
        );

        let mut scale = 1.0;
        for _ in 0..MAX_SEGMENT_ITERATIONS {
            if self.memory_total() <= limit {
                return Ok(());
            }
            scale *= self.memory_total() / limit;
            self.segments = self.calc_segment_times(scale)?;
        }
        Err(StageError::Internal(format!(
            "segment sizes did not converge below {} GB",
            limit
        )))
    }

    /// Integrations (in resampled units) searched for a trial. Later
    /// segments skip the leading integrations already covered by the
    /// overlap with the previous segment.
    pub fn get_search_ints(&self, segment: usize, dmind: usize, dtind: usize) -> Vec<usize> {
        let (Some(&shift), Some(&dt)) = (self.dmshifts.get(dmind), self.dtarr.get(dtind)) else {
            return Vec::new();
        };
        let readints = self.readints();
        let valid = readints.saturating_sub(shift);
        let nout = valid / dt;
        let first = if segment == 0 {
            0
        } else {
            self.overlap_ints().saturating_sub(shift)
        };
        (first..valid)
            .filter(|i| i % dt == 0)
            .map(|i| i / dt)
            .filter(|&i| i < nout)
            .collect()
    }

    /// Converts an image pixel to direction cosines `(l, m)` in radians.
    pub fn pixtolm(&self, pix: (usize, usize)) -> (f64, f64) {
        let (peakx, peaky) = pix;
        let dl = ((self.npixx / 2) as f64 - peakx as f64) / (self.npixx as f64 * self.uvres);
        let dm = ((self.npixy / 2) as f64 - peaky as f64) / (self.npixy as f64 * self.uvres);
        (dl, dm)
    }

    /// Index of the first DM trial above `dm`, or the last trial.
    pub fn dmind_for(&self, dm: f64) -> usize {
        self.dmarr
            .iter()
            .position(|&trial| trial > dm)
            .unwrap_or(self.dmarr.len().saturating_sub(1))
    }

    /// Baseline coordinates in wavelengths at the middle of a segment.
    pub fn get_uvw_segment(&self, segment: usize) -> StageResult<Uvw> {
        self.segment_bounds(segment)?;
        let (start, stop) = self.segmenttimes()[segment];
        let mjd = (start + stop) / 2.0;
        log::debug!("Getting uvw for segment {} at MJD {:.6}", segment, mjd);
        let (ur, vr, wr) = calc_uvw(
            mjd,
            self.metadata.radec,
            &self.metadata.antpos,
            self.metadata.latitude,
            self.metadata.longitude,
        );
        Ok(Uvw::from_metres(&ur, &vr, &wr, &self.freq))
    }
}

/// Small simulated scan shared by unit tests across the crate.
#[cfg(test)]
pub(crate) fn mock_state(prefs: Preferences) -> State {
    let t0 = 58_000.0;
    let metadata = crate::interface::metadata::mock_metadata(
        t0,
        t0 + 0.5 / SECONDS_PER_DAY,
        16,
        1,
        16,
        2,
        5e3,
    )
    .unwrap();
    State::new(metadata, prefs).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npix_uses_powers_of_two_and_three() {
        assert_eq!(calc_npix(73.5), 81);
        assert_eq!(calc_npix(100.0), 108);
        assert_eq!(calc_npix(0.5), 1);
    }

    #[test]
    fn default_state_searches_single_segment() {
        let state = mock_state(Preferences::default());
        assert_eq!(state.dmarr, vec![0.0]);
        assert_eq!(state.nsegment(), 1);
        assert_eq!(state.datashape(), (100, 120, 16, 2));
        assert_eq!(state.get_search_ints(0, 0, 0), (0..100).collect::<Vec<_>>());
        assert!(state.npixx >= 2 && state.npixy >= 2);
    }

    #[test]
    fn image_centre_maps_to_phase_centre() {
        let state = mock_state(Preferences::default());
        assert_eq!(state.pixtolm((state.npixx / 2, state.npixy / 2)), (0.0, 0.0));
        let (l, _) = state.pixtolm((state.npixx / 2 + 1, state.npixy / 2));
        assert!((l + 1.0 / (state.npixx as f64 * state.uvres)).abs() < 1e-12);
    }

    #[test]
    fn npix_max_caps_image_size() {
        let state = mock_state(Preferences {
            npix_max: Some(32),
            ..Default::default()
        });
        assert!(state.npixx <= 32 && state.npixy <= 32);
    }

    #[test]
    fn dispersion_sets_overlap_between_segments() {
        let state = mock_state(Preferences {
            maxdm: 500.0,
            nsegment: Some(3),
            ..Default::default()
        });
        assert!(state.dmarr.len() > 1);
        assert_eq!(*state.dmarr.last().unwrap(), 500.0);
        assert!(state.t_overlap > 0.0);
        assert!(state.nsegment() >= 3);

        let overlap = state.overlap_ints();
        let bounds: Vec<_> = (0..state.nsegment())
            .map(|seg| state.segment_bounds(seg).unwrap())
            .collect();
        for pair in bounds.windows(2) {
            assert_eq!(pair[0].1 - pair[1].0, overlap);
        }

        let last_dm = state.dmarr.len() - 1;
        assert_eq!(state.get_search_ints(1, last_dm, 0).first(), Some(&0));
        let shift = state.dmshifts[0];
        assert_eq!(state.get_search_ints(1, 0, 0).first(), Some(&(overlap - shift)));
    }

    #[test]
    fn resampled_search_ints_fit_resampled_data() {
        let state = mock_state(Preferences {
            dtarr: vec![1, 3],
            ..Default::default()
        });
        let ints = state.get_search_ints(0, 0, 1);
        assert_eq!(ints.len(), 100 / 3);
        assert_eq!(*ints.last().unwrap(), 100 / 3 - 1);
    }

    #[test]
    fn memory_limit_splits_scan() {
        let unconstrained = mock_state(Preferences::default());
        let limit = unconstrained.memory_total() / 4.0;
        let state = mock_state(Preferences {
            memory_limit: limit,
            ..Default::default()
        });
        assert!(state.nsegment() > 1);
        assert!(state.memory_total() <= limit);
    }

    #[test]
    fn impossible_memory_limit_is_rejected() {
        let t0 = 58_000.0;
        let metadata = crate::interface::metadata::mock_metadata(
            t0,
            t0 + 0.5 / SECONDS_PER_DAY,
            16,
            1,
            16,
            2,
            5e3,
        )
        .unwrap();
        let prefs = Preferences {
            memory_limit: 1e-9,
            ..Default::default()
        };
        assert!(matches!(
            State::new(metadata, prefs),
            Err(StageError::Config(_))
        ));
    }

    #[test]
    fn channel_selection_restricts_frequencies() {
        let state = mock_state(Preferences {
            chans: Some(vec![2, 3, 4]),
            ..Default::default()
        });
        assert_eq!(state.nchan(), 3);
        assert_eq!(state.freq[0], state.metadata.freq_orig()[2]);
        let uvw = state.get_uvw_segment(0).unwrap();
        assert_eq!((uvw.nbl(), uvw.nchan()), (120, 3));
        assert!(state.get_uvw_segment(5).is_err());
    }

    #[test]
    fn preferences_deserialize_with_defaults() {
        let prefs: Preferences =
            serde_json::from_str(r#"{"maxdm": 50, "searchtype": "image1k", "dtarr": [1, 2]}"#)
                .unwrap();
        assert_eq!(prefs.maxdm, 50.0);
        assert_eq!(prefs.searchtype, SearchType::Image1k);
        assert_eq!(prefs.sigma_image1, 7.0);
    }
}
