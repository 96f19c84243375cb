use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

mod stresstest;
mod workloads;

use workloads::WorkloadsConfig;

/// Drives concurrent callers against revalidate functions and reports
/// throughput and latency percentiles per workload.
#[derive(Parser)]
struct Cli {
    /// Path to the workload definition file (YAML). A built-in set of
    /// workloads is used when omitted.
    #[arg(long = "workloads", short = 'w', value_name = "FILE")]
    workloads: Option<PathBuf>,

    /// Duration of the stresstest.
    #[arg(long = "duration", short = 'd', value_parser = humantime::parse_duration, default_value = "10s")]
    duration: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt::init();

    let workloads = match cli.workloads {
        Some(path) => {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("failed to open workloads file {}", path.display()))?;
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?
        }
        None => WorkloadsConfig::default(),
    };

    stresstest::perform_stresstest(workloads, cli.duration).await
}
