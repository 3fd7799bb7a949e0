use ndarray::Array4;
use num_complex::Complex32;

use crate::interface::candidate::CandCollection;
use crate::state::State;

/// Visibility cube with axes `(nint, nbl, nchan, npol)`.
///
/// A sample equal to exactly `0+0i` is treated as flagged by every kernel
/// that weights by valid samples.
pub type Visibilities = Array4<Complex32>;

/// Input payload for a processing stage.
#[derive(Debug, Clone)]
pub struct StageInput {
    pub data: Visibilities,
    pub segment: usize,
}

impl StageInput {
    pub fn new(data: Visibilities, segment: usize) -> Self {
        Self { data, segment }
    }
}

/// Output produced by each stage.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub data: Visibilities,
    pub metadata: StageMetadata,
}

/// Metadata used for chaining stages and telemetry.
#[derive(Debug, Clone, Default)]
pub struct StageMetadata {
    pub candidates: Option<CandCollection>,
    pub notes: Vec<String>,
}

/// Common error type for stage execution.
#[derive(thiserror::Error, Debug)]
pub enum StageError {
    #[error("buffer exhaustion: {0}")]
    BufferExhaustion(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal failure: {0}")]
    Internal(String),
}

pub type StageResult<T> = Result<T, StageError>;

/// Trait describing the stages a segment passes through during a search.
pub trait ProcessingStage {
    fn initialize(&mut self, state: &State) -> StageResult<()>;
    fn execute(&mut self, input: StageInput) -> StageResult<StageOutput>;
    fn cleanup(&mut self);
}
