use anyhow::Context;
use clap::Parser;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use workflow::config::{ObservationConfig, PipelineConfig};
use workflow::runner::Runner;

mod generator;
mod workflow;

#[derive(Parser)]
#[command(author, version, about = "Simulated fast-transient search driver")]
struct Args {
    /// Load observation and search preferences from YAML
    #[arg(long)]
    workflow: Option<PathBuf>,
    #[arg(long, default_value_t = 27)]
    nants: usize,
    #[arg(long, default_value_t = 1)]
    nspw: usize,
    /// Channels per spectral window
    #[arg(long, default_value_t = 64)]
    chans: usize,
    #[arg(long, default_value_t = 2)]
    npol: usize,
    #[arg(long, default_value_t = 5000.0)]
    inttime_micros: f64,
    #[arg(long, default_value_t = 1.0)]
    duration_s: f64,
    #[arg(long, default_value_t = 0.0)]
    maxdm: f64,
    /// Image signal-to-noise threshold
    #[arg(long, default_value_t = 7.0)]
    sigma: f64,
    #[arg(long, default_value_t = 1)]
    ntransients: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Append candidate records to this JSON-lines file
    #[arg(long)]
    candsfile: Option<PathBuf>,
    /// Append the run summary to this log
    #[arg(long, default_value = "tools/data/scan_summary.log")]
    report: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = if let Some(path) = args.workflow {
        PipelineConfig::load(path)?
    } else {
        let observation = ObservationConfig {
            nants: args.nants,
            nspw: args.nspw,
            chans: args.chans,
            npol: args.npol,
            inttime_micros: args.inttime_micros,
            duration_s: args.duration_s,
            ..Default::default()
        };
        PipelineConfig::from_args(
            observation,
            args.maxdm,
            args.sigma,
            args.ntransients,
            args.seed,
        )
    };
    if let Some(candsfile) = args.candsfile {
        config.preferences.savecands = true;
        config.preferences.candsfile = Some(candsfile);
    }

    let result = Runner::new(config).execute()?;
    let summary = result.summary();
    println!("Scan search -> {}", summary);
    println!(
        "Metrics -> {}",
        serde_json::to_string(&result.metrics).context("serializing metrics")?
    );
    for cand in result.candidates.iter() {
        println!(
            "  seg {} int {} dm {:.1} dt {:.4}s snr1 {:.1} (l, m) = ({:.5}, {:.5})",
            cand.loc.segment, cand.loc.integration, cand.dm, cand.dt, cand.snr1, cand.l1, cand.m1
        );
    }

    if let Some(parent) = args.report.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating report directory {}", parent.display()))?;
        }
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.report)
        .with_context(|| format!("opening report {}", args.report.display()))?;
    file.write_all(format!("{}\n", summary).as_bytes())?;

    Ok(())
}
