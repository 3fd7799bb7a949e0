use crate::generator::transient::build_transients;
use crate::workflow::config::PipelineConfig;
use anyhow::Context;
use rfcore::interface::CandCollection;
use rfcore::pipeline::pipeline_scan;
use rfcore::state::{SimulatedTransient, State};
use rfcore::telemetry::{MetricsRecorder, MetricsSnapshot};
use std::sync::Arc;
use tokio::runtime::Builder as TokioBuilder;

pub struct ScanResult {
    pub nsegment: usize,
    pub injected: Vec<SimulatedTransient>,
    /// Resampling factor of each dt trial, to map candidates back to raw
    /// integrations.
    pub dtarr: Vec<usize>,
    pub candidates: CandCollection,
    pub metrics: MetricsSnapshot,
}

impl ScanResult {
    /// Injected transients with a candidate in the same segment within one
    /// integration of the injection.
    pub fn recovered(&self) -> usize {
        self.injected
            .iter()
            .filter(|tr| {
                self.candidates.iter().any(|cand| {
                    let Some(&factor) = self.dtarr.get(cand.loc.dtind) else {
                        return false;
                    };
                    let integration = (cand.loc.integration * factor) as f64;
                    cand.loc.segment == tr.segment && (integration - tr.integration).abs() <= 1.0
                })
            })
            .count()
    }

    pub fn summary(&self) -> String {
        format!(
            "segments={} candidates={} injected={} recovered={} max_snr1={} errors={}",
            self.nsegment,
            self.candidates.len(),
            self.injected.len(),
            self.recovered(),
            self.candidates
                .max_snr1()
                .map(|snr| format!("{:.1}", snr))
                .unwrap_or_else(|| "-".to_string()),
            self.metrics.errors
        )
    }
}

#[derive(Clone)]
pub struct Runner {
    config: PipelineConfig,
}

impl Runner {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> anyhow::Result<ScanResult> {
        let metadata = self.config.to_metadata()?;
        let mut state = State::new(metadata, self.config.preferences.clone())
            .context("configuring search state")?;
        build_transients(&self.config, &mut state)?;

        let injected = state.prefs.simulated_transient.clone();
        let nsegment = state.nsegment();
        let dtarr = state.dtarr.clone();
        let state = Arc::new(state);
        let metrics = Arc::new(MetricsRecorder::new());

        let runtime = TokioBuilder::new_multi_thread()
            .worker_threads(state.prefs.nthread.max(1))
            .enable_all()
            .build()
            .context("creating runtime for segment search")?;
        let candidates = runtime
            .block_on(pipeline_scan(Arc::clone(&state), Arc::clone(&metrics)))
            .context("searching scan")?;

        Ok(ScanResult {
            nsegment,
            injected,
            dtarr,
            candidates,
            metrics: metrics.snapshot(),
        })
    }
}
