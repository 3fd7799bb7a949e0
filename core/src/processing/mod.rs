pub mod buffer_pool;
pub mod calibrate;
pub mod dedisperse;
pub mod grid;
pub mod kalman;
pub mod search;

pub use buffer_pool::GridPool;
pub use calibrate::{flag_channels, meantsub, phase_shift, PrepStage};
pub use dedisperse::{calc_delay, calc_delay2, calc_dmarr, dedisperse, dedisperse_resample, resample};
pub use grid::{grid_cells, grid_integration, grid_visibilities};
pub use kalman::{
    kalman_filter_detector, kalman_prepare_coeffs, kalman_significance,
    kalman_significance_canddata, KalmanCoeffs,
};
pub use search::{dedisperse_image, grid_image, search_thresh, ImageSearchStage, SearchResources};
