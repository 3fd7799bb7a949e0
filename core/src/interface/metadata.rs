use serde::{Deserialize, Serialize};

use crate::math::geometry::{baseline_order, gmst};
use crate::prelude::{StageError, StageResult};

const SECONDS_PER_DAY: f64 = 86_400.0;
const VLA_LATITUDE_DEG: f64 = 34.078_749;
const VLA_LONGITUDE_DEG: f64 = -107.618_283;
const VLA_DISH_DIAMETER_M: f64 = 25.0;
/// Arm label and azimuth (degrees east of north) of a Y-shaped array.
const ARM_AZIMUTHS_DEG: [(char, f64); 3] = [('N', 355.0), ('E', 115.0), ('W', 236.0)];
const MOCK_SPW_START_HZ: f64 = 2.488e9;
const MOCK_SPW_STEP_HZ: f64 = 128e6;
const MOCK_CHANSIZE_HZ: f64 = 2e6;

/// Description of a single scan as seen by the search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub datasource: String,
    pub datasetid: String,
    pub scan: usize,
    pub starttime_mjd: f64,
    pub endtime_mjd: f64,
    /// Integration time in seconds.
    pub inttime: f64,
    pub nints: usize,
    pub antids: Vec<String>,
    /// Local east/north/up antenna offsets in metres.
    pub antpos: Vec<[f64; 3]>,
    pub spw_reffreq: Vec<f64>,
    pub spw_nchan: Vec<usize>,
    pub spw_chansize: Vec<f64>,
    pub npol: usize,
    /// Phase centre `(ra, dec)` in radians.
    pub radec: (f64, f64),
    pub latitude: f64,
    pub longitude: f64,
    pub dishdiameter: f64,
}

impl Metadata {
    pub fn nants(&self) -> usize {
        self.antpos.len()
    }

    pub fn nbl(&self) -> usize {
        let nants = self.nants();
        nants * nants.saturating_sub(1) / 2
    }

    pub fn blarr(&self) -> Vec<(usize, usize)> {
        baseline_order(self.nants())
    }

    /// Channel centre frequencies in GHz, spectral windows in order.
    pub fn freq_orig(&self) -> Vec<f64> {
        self.spw_reffreq
            .iter()
            .zip(self.spw_nchan.iter())
            .zip(self.spw_chansize.iter())
            .flat_map(|((&reffreq, &nchan), &chansize)| {
                (0..nchan).map(move |ch| (reffreq + ch as f64 * chansize) / 1e9)
            })
            .collect()
    }

    /// Arm label (`N`, `E`, `W`) taken from the antenna name, if any.
    pub fn antenna_arm(&self, ant: usize) -> Option<char> {
        self.antids
            .get(ant)
            .and_then(|name| name.chars().next())
            .filter(|c| matches!(c, 'N' | 'E' | 'W'))
    }

    pub fn validate(&self) -> StageResult<()> {
        if self.nants() < 2 {
            return Err(StageError::Config("at least two antennas required".into()));
        }
        if self.antids.len() != self.antpos.len() {
            return Err(StageError::Config(format!(
                "{} antenna names for {} positions",
                self.antids.len(),
                self.antpos.len()
            )));
        }
        if self.spw_reffreq.is_empty()
            || self.spw_reffreq.len() != self.spw_nchan.len()
            || self.spw_reffreq.len() != self.spw_chansize.len()
        {
            return Err(StageError::Config(
                "spectral window description is empty or inconsistent".into(),
            ));
        }
        if self.nints == 0 || self.inttime <= 0.0 {
            return Err(StageError::Config(format!(
                "scan has {} integrations of {} s",
                self.nints, self.inttime
            )));
        }
        if self.npol == 0 {
            return Err(StageError::Config("npol must be positive".into()));
        }
        Ok(())
    }
}

fn y_array_layout(nants: usize) -> (Vec<String>, Vec<[f64; 3]>) {
    (0..nants)
        .map(|ant| {
            let (arm, azimuth) = ARM_AZIMUTHS_DEG[ant % 3];
            let station = ant / 3 + 1;
            let radius = 14.0 * (station as f64).powf(1.716);
            let (sin_az, cos_az) = azimuth.to_radians().sin_cos();
            (
                format!("{}{:02}", arm, station),
                [radius * sin_az, radius * cos_az, 0.0],
            )
        })
        .unzip()
}

/// Builds metadata for a simulated scan from `t0` to `t1` (MJD) on a
/// compact Y-shaped array.
pub fn mock_metadata(
    t0: f64,
    t1: f64,
    nants: usize,
    nspw: usize,
    chans: usize,
    npol: usize,
    inttime_micros: f64,
) -> StageResult<Metadata> {
    if t1 <= t0 {
        return Err(StageError::Config(format!(
            "scan stop {} is not after start {}",
            t1, t0
        )));
    }
    let inttime = inttime_micros * 1e-6;
    if inttime <= 0.0 {
        return Err(StageError::Config("inttime must be positive".into()));
    }
    let nints = ((t1 - t0) * SECONDS_PER_DAY / inttime).round() as usize;
    let (antids, antpos) = y_array_layout(nants);
    let longitude = VLA_LONGITUDE_DEG.to_radians();
    let ra = (gmst(t0) + longitude).rem_euclid(std::f64::consts::TAU);

    let metadata = Metadata {
        datasource: "sim".into(),
        datasetid: format!("mock_{:.6}", t0),
        scan: 1,
        starttime_mjd: t0,
        endtime_mjd: t0 + nints as f64 * inttime / SECONDS_PER_DAY,
        inttime,
        nints,
        antids,
        antpos,
        spw_reffreq: (0..nspw)
            .map(|spw| MOCK_SPW_START_HZ + spw as f64 * MOCK_SPW_STEP_HZ)
            .collect(),
        spw_nchan: vec![chans; nspw],
        spw_chansize: vec![MOCK_CHANSIZE_HZ; nspw],
        npol,
        radec: (ra, 0.5),
        latitude: VLA_LATITUDE_DEG.to_radians(),
        longitude,
        dishdiameter: VLA_DISH_DIAMETER_M,
    };
    metadata.validate()?;
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_metadata_describes_requested_scan() {
        let t0 = 58_000.0;
        let meta = mock_metadata(t0, t0 + 0.5 / SECONDS_PER_DAY, 27, 4, 64, 2, 5e3).unwrap();
        assert_eq!(meta.nints, 100);
        assert_eq!(meta.nbl(), 351);
        assert_eq!(meta.blarr().len(), meta.nbl());
        let freq = meta.freq_orig();
        assert_eq!(freq.len(), 4 * 64);
        assert!((freq[0] - 2.488).abs() < 1e-9);
        assert!(freq.windows(2).all(|pair| pair[1] > pair[0]));
    }

    #[test]
    fn mock_antennas_are_labelled_by_arm() {
        let t0 = 58_000.0;
        let meta = mock_metadata(t0, t0 + 0.1 / SECONDS_PER_DAY, 6, 1, 8, 1, 5e3).unwrap();
        assert_eq!(meta.antids[0], "N01");
        assert_eq!(meta.antenna_arm(1), Some('E'));
        assert_eq!(meta.antenna_arm(5), Some('W'));
        assert_eq!(meta.antenna_arm(9), None);
    }

    #[test]
    fn mock_metadata_rejects_empty_scan() {
        assert!(mock_metadata(58_000.0, 58_000.0, 4, 1, 8, 1, 5e3).is_err());
        assert!(mock_metadata(58_000.0, 58_000.1, 1, 1, 8, 1, 5e3).is_err());
    }
}
