use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::ops::AddAssign;
use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::math::stats::StatsHelper;
use crate::prelude::StageResult;
use crate::state::{Preferences, State};

/// Position of a candidate in the search space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandLocation {
    pub segment: usize,
    /// Integration index in the dedispersed, resampled segment.
    pub integration: usize,
    pub dmind: usize,
    pub dtind: usize,
    pub beamnum: usize,
}

/// Full product of a detection: image, phased spectra and scores.
#[derive(Debug, Clone)]
pub struct CandData {
    pub loc: CandLocation,
    pub dm: f64,
    /// Effective integration time after resampling, in seconds.
    pub dt: f64,
    pub image: Array2<f32>,
    /// Visibilities phased to `(l1, m1)` and averaged over baselines,
    /// shape `(nwindow, nchan, npol)`.
    pub data: Array3<Complex32>,
    /// Row of `data` holding the candidate integration.
    pub window_offset: usize,
    pub snr1: f64,
    pub snrk: Option<f64>,
    pub l1: f64,
    pub m1: f64,
}

impl CandData {
    /// Real spectrum at the candidate integration, averaged over polarisation.
    pub fn spectrum(&self) -> Vec<f64> {
        if self.window_offset >= self.data.len_of(Axis(0)) {
            return Vec::new();
        }
        self.data
            .index_axis(Axis(0), self.window_offset)
            .outer_iter()
            .map(|pols| {
                let npol = pols.len().max(1) as f64;
                pols.iter().map(|v| v.re as f64).sum::<f64>() / npol
            })
            .collect()
    }

    pub fn features(&self) -> CandRecord {
        let immax1 = self
            .image
            .iter()
            .fold(f32::NEG_INFINITY, |acc, &v| acc.max(v)) as f64;
        CandRecord {
            loc: self.loc,
            dm: self.dm,
            dt: self.dt,
            snr1: self.snr1,
            immax1,
            l1: self.l1,
            m1: self.m1,
            snrk: self.snrk,
            specstd: StatsHelper::std(&self.spectrum()),
        }
    }

    /// Approximate in-memory footprint used to bound accumulation.
    pub fn nbytes(&self) -> usize {
        4 * self.image.len() + 8 * self.data.len()
    }
}

/// Feature vector retained for each candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandRecord {
    pub loc: CandLocation,
    pub dm: f64,
    pub dt: f64,
    pub snr1: f64,
    pub immax1: f64,
    pub l1: f64,
    pub m1: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snrk: Option<f64>,
    pub specstd: f64,
}

/// Scan context stored alongside saved candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub datasetid: String,
    pub scan: usize,
    pub inttime: f64,
    /// Lowest and highest searched frequency in GHz.
    pub freq_span: (f64, f64),
}

impl ScanSummary {
    pub fn from_state(state: &State) -> Self {
        let fmin = state.freq.iter().cloned().fold(f64::INFINITY, f64::min);
        let fmax = state.freq.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        Self {
            datasetid: state.metadata.datasetid.clone(),
            scan: state.metadata.scan,
            inttime: state.inttime(),
            freq_span: (fmin, fmax),
        }
    }
}

/// Candidates accumulated over trials and segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandCollection {
    pub records: Vec<CandRecord>,
    #[serde(default)]
    pub prefs: Option<Preferences>,
    #[serde(default)]
    pub summary: Option<ScanSummary>,
}

impl CandCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty collection tagged with the search preferences and scan summary.
    pub fn for_state(state: &State) -> Self {
        Self {
            records: Vec::new(),
            prefs: Some(state.prefs.clone()),
            summary: Some(ScanSummary::from_state(state)),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CandRecord> {
        self.records.iter()
    }

    pub fn max_snr1(&self) -> Option<f64> {
        self.records.iter().map(|r| r.snr1).reduce(f64::max)
    }
}

impl AddAssign for CandCollection {
    fn add_assign(&mut self, other: Self) {
        self.records.extend(other.records);
        if self.prefs.is_none() {
            self.prefs = other.prefs;
        }
        if self.summary.is_none() {
            self.summary = other.summary;
        }
    }
}

/// Reduces full candidate products to their feature records.
pub fn calc_features(canddatalist: &[CandData]) -> CandCollection {
    CandCollection {
        records: canddatalist.iter().map(CandData::features).collect(),
        ..Default::default()
    }
}

/// Appends the collection to `path` as one JSON line and returns the number
/// of records written.
pub fn save_cands(path: &Path, collection: &CandCollection) -> StageResult<usize> {
    if collection.is_empty() {
        return Ok(0);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut block = serde_json::to_string(collection)?;
    block.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(block.as_bytes())?;
    Ok(collection.len())
}

pub fn load_cands(path: &Path) -> StageResult<CandCollection> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut collection = CandCollection::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        collection += serde_json::from_str::<CandCollection>(&line)?;
    }
    Ok(collection)
}
