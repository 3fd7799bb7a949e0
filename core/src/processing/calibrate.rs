use std::f64::consts::PI;

use ndarray::{s, ArrayViewMut4, Axis};
use num_complex::Complex32;
use rustfft::num_traits::Zero;

use crate::math::geometry::Uvw;
use crate::math::stats::StatsHelper;
use crate::prelude::{
    ProcessingStage, StageError, StageInput, StageMetadata, StageOutput, StageResult,
};
use crate::state::State;
use crate::telemetry::log::LogManager;

/// Subtracts the time mean of every `(bl, chan, pol)` series. The mean and
/// the subtraction both skip zero (flagged) samples.
pub fn meantsub(mut data: ArrayViewMut4<Complex32>) {
    for mut series in data.lanes_mut(Axis(0)) {
        let mut sum = Complex32::zero();
        let mut weight = 0usize;
        for value in series.iter() {
            if !value.is_zero() {
                sum += *value;
                weight += 1;
            }
        }
        if weight == 0 {
            continue;
        }
        let mean = sum / weight as f32;
        if mean.is_zero() {
            continue;
        }
        for value in series.iter_mut() {
            if !value.is_zero() {
                *value -= mean;
            }
        }
    }
}

/// Rotates the phase centre by `(dl, dm)` radians for the given
/// integrations (all when `ints` is `None`).
pub fn phase_shift(
    mut data: ArrayViewMut4<Complex32>,
    uvw: &Uvw,
    dl: f64,
    dm: f64,
    ints: Option<&[usize]>,
) -> StageResult<()> {
    let (nint, nbl, nchan, _) = data.dim();
    if uvw.nbl() != nbl || uvw.nchan() != nchan {
        return Err(StageError::ShapeMismatch(format!(
            "uvw ({}, {}) does not match data ({}, {})",
            uvw.nbl(),
            uvw.nchan(),
            nbl,
            nchan
        )));
    }
    if dl == 0.0 && dm == 0.0 {
        return Ok(());
    }

    let all: Vec<usize>;
    let ints = match ints {
        Some(ints) => ints,
        None => {
            all = (0..nint).collect();
            &all
        }
    };
    if let Some(&bad) = ints.iter().find(|&&i| i >= nint) {
        return Err(StageError::InvalidInput(format!(
            "integration {} outside {} available",
            bad, nint
        )));
    }

    for j in 0..nbl {
        for k in 0..nchan {
            let phase =
                -2.0 * PI * (dl * uvw.u[[j, k]] as f64 + dm * uvw.v[[j, k]] as f64);
            let frot = Complex32::from_polar(1.0, phase as f32);
            for &i in ints {
                data.slice_mut(s![i, j, k, ..]).mapv_inplace(|v| v * frot);
            }
        }
    }
    Ok(())
}

/// Zeros every listed channel so later stages treat it as flagged.
pub fn flag_channels(mut data: ArrayViewMut4<Complex32>, chans: &[usize]) -> StageResult<()> {
    let nchan = data.len_of(Axis(2));
    for &ch in chans {
        if ch >= nchan {
            return Err(StageError::InvalidInput(format!(
                "flagged channel {} outside {} available",
                ch, nchan
            )));
        }
        data.slice_mut(s![.., .., ch, ..]).fill(Complex32::zero());
    }
    Ok(())
}

/// Data-preparation stage: channel flagging followed by mean subtraction.
pub struct PrepStage {
    flaglist: Vec<usize>,
    datashape: Option<(usize, usize, usize, usize)>,
    logger: LogManager,
}

impl PrepStage {
    pub fn new() -> Self {
        Self {
            flaglist: Vec::new(),
            datashape: None,
            logger: LogManager::new("prep"),
        }
    }
}

impl Default for PrepStage {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingStage for PrepStage {
    fn initialize(&mut self, state: &State) -> StageResult<()> {
        self.flaglist = state.prefs.flaglist.clone();
        self.datashape = Some(state.datashape());
        self.logger
            .detail(&format!("expecting segments of shape {:?}", state.datashape()));
        Ok(())
    }

    fn execute(&mut self, input: StageInput) -> StageResult<StageOutput> {
        let datashape = self
            .datashape
            .ok_or_else(|| StageError::Internal("stage not initialized".into()))?;

        let mut data = input.data;
        if data.dim() != datashape {
            return Err(StageError::ShapeMismatch(format!(
                "segment {} has shape {:?}, expected {:?}",
                input.segment,
                data.dim(),
                datashape
            )));
        }

        flag_channels(data.view_mut(), &self.flaglist)?;
        meantsub(data.view_mut());

        let amplitudes: Vec<f32> = data.iter().map(|v| v.norm()).collect();
        let rms = StatsHelper::rms(&amplitudes);
        self.logger.record(&format!(
            "segment {} prepared with {} flagged channels, rms {:.4}",
            input.segment,
            self.flaglist.len(),
            rms
        ));

        Ok(StageOutput {
            data,
            metadata: StageMetadata {
                notes: vec![format!("prep rms {:.4}", rms)],
                ..Default::default()
            },
        })
    }

    fn cleanup(&mut self) {
        self.flaglist.clear();
        self.datashape = None;
    }
}
