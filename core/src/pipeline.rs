//! Segment and scan drivers: read, prepare and search each segment, then
//! merge the candidates.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Semaphore;

use crate::interface::candidate::{save_cands, CandCollection};
use crate::prelude::{ProcessingStage, StageError, StageInput, StageOutput, StageResult};
use crate::processing::calibrate::PrepStage;
use crate::processing::search::ImageSearchStage;
use crate::source::read_segment;
use crate::state::State;
use crate::telemetry::metrics::MetricsRecorder;

/// File candidates are appended to when `savecands` is set and no
/// `candsfile` is configured.
pub fn default_candsfile(state: &State) -> PathBuf {
    PathBuf::from(format!(
        "cands_{}_{}.jsonl",
        state.metadata.datasetid, state.metadata.scan
    ))
}

fn run_stage<S: ProcessingStage>(
    stage: &mut S,
    state: &State,
    input: StageInput,
) -> StageResult<StageOutput> {
    stage.initialize(state)?;
    let output = stage.execute(input);
    stage.cleanup();
    output
}

/// Reads, prepares and searches one segment.
pub fn pipeline_seg(
    state: &State,
    segment: usize,
    metrics: &MetricsRecorder,
) -> StageResult<CandCollection> {
    let result = search_segment(state, segment);
    match &result {
        Ok(collection) => metrics.record_segment(collection.len()),
        Err(err) => {
            error!("Segment {} failed: {}", segment, err);
            metrics.record_error();
        }
    }
    result
}

fn search_segment(state: &State, segment: usize) -> StageResult<CandCollection> {
    let mut rng = StdRng::seed_from_u64(state.prefs.seed.wrapping_add(segment as u64));
    let data = read_segment(state, segment, &mut rng)?;

    let prepared = run_stage(&mut PrepStage::new(), state, StageInput::new(data, segment))?;
    let searched = run_stage(
        &mut ImageSearchStage::new(),
        state,
        StageInput::new(prepared.data, segment),
    )?;
    let collection = searched.metadata.candidates.unwrap_or_default();

    if state.prefs.savecands && !collection.is_empty() {
        let path = state
            .prefs
            .candsfile
            .clone()
            .unwrap_or_else(|| default_candsfile(state));
        let written = save_cands(&path, &collection)?;
        info!("Saved {} candidates to {}", written, path.display());
    }
    Ok(collection)
}

/// Searches every segment of the scan with at most `nthread` segments in
/// flight and merges their candidates in segment order.
pub async fn pipeline_scan(
    state: Arc<State>,
    metrics: Arc<MetricsRecorder>,
) -> StageResult<CandCollection> {
    let permits = Arc::new(Semaphore::new(state.prefs.nthread.max(1)));
    info!(
        "Searching {} segments of scan {} with {} workers",
        state.nsegment(),
        state.metadata.scan,
        state.prefs.nthread.max(1)
    );

    let mut handles = Vec::with_capacity(state.nsegment());
    for segment in 0..state.nsegment() {
        let permit = permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| StageError::Internal(err.to_string()))?;
        let state = Arc::clone(&state);
        let metrics = Arc::clone(&metrics);
        handles.push(tokio::task::spawn_blocking(move || {
            let result = pipeline_seg(&state, segment, &metrics);
            drop(permit);
            result
        }));
    }

    // Join every task before reporting the first error.
    let mut collection = CandCollection::new();
    let mut first_error = None;
    for handle in handles {
        let result = handle
            .await
            .map_err(|err| StageError::Internal(err.to_string()))
            .and_then(|result| result);
        match result {
            Ok(segment_cands) => collection += segment_cands,
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    info!("Scan produced {} candidates", collection.len());
    Ok(collection)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::candidate::load_cands;
    use crate::state::{mock_state, Preferences, SimulatedTransient};

    fn bright_state(prefs: Preferences) -> State {
        let mut state = mock_state(Preferences {
            sigma_image1: 6.0,
            ..prefs
        });
        state.prefs.simulated_transient = vec![SimulatedTransient {
            segment: 0,
            integration: 50.0,
            dm: 0.0,
            dt: state.inttime(),
            amp: 3.0,
            l: 0.0,
            m: 0.0,
        }];
        state
    }

    #[test]
    fn segment_search_recovers_injected_pulse() {
        let state = bright_state(Preferences::default());
        let metrics = MetricsRecorder::new();
        let collection = pipeline_seg(&state, 0, &metrics).unwrap();
        assert!(collection
            .iter()
            .any(|c| c.loc.integration == 50 && c.loc.dmind == 0 && c.loc.dtind == 0));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.segments, 1);
        assert_eq!(snapshot.candidates, collection.len());
    }

    #[test]
    fn bad_segment_is_counted_as_error() {
        let state = mock_state(Preferences::default());
        let metrics = MetricsRecorder::new();
        assert!(pipeline_seg(&state, 9, &metrics).is_err());
        assert_eq!(metrics.snapshot().errors, 1);
    }

    #[test]
    fn candidates_are_saved_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cands.jsonl");
        let state = bright_state(Preferences {
            savecands: true,
            candsfile: Some(path.clone()),
            ..Default::default()
        });
        let collection = pipeline_seg(&state, 0, &MetricsRecorder::new()).unwrap();
        let loaded = load_cands(&path).unwrap();
        assert_eq!(loaded.len(), collection.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scan_merges_segments() {
        let state = Arc::new(bright_state(Preferences {
            nthread: 2,
            ..Default::default()
        }));
        let metrics = Arc::new(MetricsRecorder::new());
        let collection = pipeline_scan(Arc::clone(&state), Arc::clone(&metrics))
            .await
            .unwrap();
        assert!(collection.iter().any(|c| c.loc.integration == 50));
        assert_eq!(metrics.snapshot().segments, state.nsegment());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn later_segments_merge_in_order() {
        let mut state = mock_state(Preferences {
            sigma_image1: 6.0,
            nsegment: Some(3),
            nthread: 2,
            ..Default::default()
        });
        assert_eq!(state.nsegment(), 3);
        let dt = state.inttime();
        let pulse = |segment, integration| SimulatedTransient {
            segment,
            integration,
            dm: 0.0,
            dt,
            amp: 3.0,
            l: 0.0,
            m: 0.0,
        };
        state.prefs.simulated_transient = vec![pulse(2, 10.0), pulse(1, 20.0)];
        let state = Arc::new(state);
        let metrics = Arc::new(MetricsRecorder::new());

        let collection = pipeline_scan(Arc::clone(&state), Arc::clone(&metrics))
            .await
            .unwrap();
        let segments: Vec<_> = collection.iter().map(|c| c.loc.segment).collect();
        assert!(segments.windows(2).all(|pair| pair[0] <= pair[1]));
        assert!(collection
            .iter()
            .any(|c| c.loc.segment == 1 && c.loc.integration == 20));
        assert!(collection
            .iter()
            .any(|c| c.loc.segment == 2 && c.loc.integration == 10));
        assert_eq!(metrics.snapshot().segments, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_scan_waits_for_every_segment() {
        let state = Arc::new(mock_state(Preferences {
            nsegment: Some(3),
            nthread: 2,
            flaglist: vec![999],
            ..Default::default()
        }));
        let metrics = Arc::new(MetricsRecorder::new());

        let result = pipeline_scan(Arc::clone(&state), Arc::clone(&metrics)).await;
        assert!(matches!(result, Err(StageError::InvalidInput(_))));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.errors, state.nsegment());
        assert_eq!(snapshot.segments, 0);
    }
}
