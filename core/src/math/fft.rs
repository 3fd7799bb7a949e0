use std::sync::Arc;

use ndarray::Array2;
use num_complex::Complex32;
use rustfft::{num_traits::Zero, Fft, FftPlanner};

use crate::prelude::{StageError, StageResult};

/// Reusable inverse 2-D FFT plan for `(npixx, npixy)` image grids.
///
/// Planning once per segment and reusing the plan across integrations and
/// DM/dt trials stands in for FFT "wisdom".
pub struct ImagePlan {
    npixx: usize,
    npixy: usize,
    fft_x: Arc<dyn Fft<f32>>,
    fft_y: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex32>,
    column: Vec<Complex32>,
}

impl ImagePlan {
    pub fn new(npixx: usize, npixy: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft_x = planner.plan_fft_inverse(npixx.max(1));
        let fft_y = planner.plan_fft_inverse(npixy.max(1));
        let scratch_len = fft_x
            .get_inplace_scratch_len()
            .max(fft_y.get_inplace_scratch_len());
        Self {
            npixx,
            npixy,
            fft_x,
            fft_y,
            scratch: vec![Complex32::zero(); scratch_len],
            column: vec![Complex32::zero(); npixx.max(1)],
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.npixx, self.npixy)
    }

    /// Inverse-transforms `grid` in place and returns the recentred real image.
    pub fn image(&mut self, grid: &mut Array2<Complex32>) -> StageResult<Array2<f32>> {
        if grid.dim() != (self.npixx, self.npixy) {
            return Err(StageError::ShapeMismatch(format!(
                "grid {:?} does not match plan ({}, {})",
                grid.dim(),
                self.npixx,
                self.npixy
            )));
        }

        let rows = grid
            .as_slice_mut()
            .ok_or_else(|| StageError::Internal("grid is not contiguous".into()))?;
        self.fft_y.process_with_scratch(rows, &mut self.scratch);

        for mut lane in grid.columns_mut() {
            for (dst, src) in self.column.iter_mut().zip(lane.iter()) {
                *dst = *src;
            }
            self.fft_x
                .process_with_scratch(&mut self.column, &mut self.scratch);
            for (dst, src) in lane.iter_mut().zip(self.column.iter()) {
                *dst = *src;
            }
        }

        let norm = 1.0 / (self.npixx * self.npixy) as f32;
        let real = grid.mapv(|value| value.re * norm);
        Ok(fftshift2(&real))
    }
}

/// Moves the zero-frequency pixel to `(nx / 2, ny / 2)`.
pub fn fftshift2(image: &Array2<f32>) -> Array2<f32> {
    let (nx, ny) = image.dim();
    let mut shifted = Array2::<f32>::zeros((nx, ny));
    for ((i, j), &value) in image.indexed_iter() {
        shifted[[(i + nx / 2) % nx, (j + ny / 2) % ny]] = value;
    }
    shifted
}
