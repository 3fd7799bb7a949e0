pub mod candidate;
pub mod metadata;

pub use candidate::{calc_features, load_cands, save_cands, CandCollection, CandData, CandLocation, CandRecord, ScanSummary};
pub use metadata::{mock_metadata, Metadata};
