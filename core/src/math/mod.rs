pub mod fft;
pub mod geometry;
pub mod matrix;
pub mod stats;

pub use fft::{fftshift2, ImagePlan};
pub use geometry::{calc_uvw, Uvw};
pub use matrix::MatrixHelper;
pub use stats::StatsHelper;
