use anyhow::Context;
use rfcore::interface::{mock_metadata, Metadata};
use rfcore::state::Preferences;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Shape of the simulated observation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservationConfig {
    pub starttime_mjd: f64,
    pub duration_s: f64,
    pub nants: usize,
    pub nspw: usize,
    pub chans: usize,
    pub npol: usize,
    pub inttime_micros: f64,
}

impl Default for ObservationConfig {
    fn default() -> Self {
        Self {
            starttime_mjd: 58_000.0,
            duration_s: 1.0,
            nants: 27,
            nspw: 1,
            chans: 64,
            npol: 2,
            inttime_micros: 5_000.0,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub observation: ObservationConfig,
    pub preferences: Preferences,
    /// Random transients injected in addition to any listed in the
    /// preferences.
    pub ntransients: usize,
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref)
            .with_context(|| format!("reading workflow config {}", path_ref.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing workflow config {}", path_ref.display()))?;
        Ok(config)
    }

    pub fn from_args(
        observation: ObservationConfig,
        maxdm: f64,
        sigma: f64,
        ntransients: usize,
        seed: u64,
    ) -> Self {
        Self {
            observation,
            preferences: Preferences {
                maxdm,
                sigma_image1: sigma,
                seed,
                ..Default::default()
            },
            ntransients,
        }
    }

    pub fn to_metadata(&self) -> anyhow::Result<Metadata> {
        let obs = &self.observation;
        let stop = obs.starttime_mjd + obs.duration_s / SECONDS_PER_DAY;
        mock_metadata(
            obs.starttime_mjd,
            stop,
            obs.nants,
            obs.nspw,
            obs.chans,
            obs.npol,
            obs.inttime_micros,
        )
        .context("building mock observation metadata")
    }
}
