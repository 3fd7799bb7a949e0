//! Core of the fast radio transient search.
//!
//! A scan is split into overlapping segments. Each segment is simulated or
//! read, flagged and mean-subtracted, then dedispersed and resampled over a
//! grid of trials, imaged, and thresholded into candidates.

pub mod interface;
pub mod math;
pub mod pipeline;
pub mod prelude;
pub mod processing;
pub mod source;
pub mod state;
pub mod telemetry;

pub use interface::{CandCollection, CandRecord, Metadata};
pub use pipeline::{pipeline_scan, pipeline_seg};
pub use prelude::{ProcessingStage, StageError, StageInput, StageOutput, StageResult};
pub use state::{Preferences, SearchType, SimulatedTransient, State};
