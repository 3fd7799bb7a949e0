use num_complex::Complex32;
use rustfft::num_traits::Zero;

use crate::prelude::StageError;

/// Scoped pool of uv-grid buffers that bounds how many grids are live at once.
pub struct GridPool {
    buffers: Vec<Vec<Complex32>>,
    outstanding: usize,
    max_capacity: usize,
}

impl GridPool {
    pub fn with_capacity(max_capacity: usize) -> Self {
        Self {
            buffers: Vec::with_capacity(max_capacity),
            outstanding: 0,
            max_capacity,
        }
    }

    /// Hands out a zeroed buffer, reusing a released one when available.
    pub fn checkout(&mut self, length: usize) -> Result<Vec<Complex32>, StageError> {
        if let Some(mut buffer) = self.buffers.pop() {
            buffer.clear();
            buffer.resize(length, Complex32::zero());
            self.outstanding += 1;
            Ok(buffer)
        } else if self.outstanding < self.max_capacity {
            self.outstanding += 1;
            Ok(vec![Complex32::zero(); length])
        } else {
            Err(StageError::BufferExhaustion(format!(
                "{} grids already checked out",
                self.outstanding
            )))
        }
    }

    /// Returns a buffer back to the pool for reuse.
    pub fn release(&mut self, buffer: Vec<Complex32>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.buffers.len() < self.max_capacity {
            self.buffers.push(buffer);
        }
    }

    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn reset(&mut self) {
        self.buffers.clear();
        self.outstanding = 0;
    }
}
