//! Charger case simulator
//!
//! Runs a JSON scenario against the case comms core and prints a summary of
//! the run as JSON.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info, LevelFilter};

use case_sim::{run, FileFlash, Scenario, SimError, Simulator};

/// Charger case simulator
#[derive(Parser, Debug)]
#[command(name = "case-sim")]
#[command(about = "Simulate a charger case talking to its earbuds", long_about = None)]
#[command(version)]
struct Args {
    /// Scenario file (JSON)
    #[arg(value_name = "SCENARIO")]
    scenario: PathBuf,

    /// File holding the persisted case configuration
    #[arg(long, default_value = "case-config.bin")]
    config: PathBuf,

    /// Scheduler period in milliseconds
    #[arg(long, default_value_t = 10)]
    period_ms: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

async fn simulate(args: &Args) -> Result<String, SimError> {
    let scenario = Scenario::load(&args.scenario)?;
    info!(
        "Scenario {}: {} periodics, {} events",
        args.scenario.display(),
        scenario.duration,
        scenario.events.len()
    );

    let sim = Simulator::new(scenario, FileFlash::new(&args.config));
    let summary = run(sim, Duration::from_millis(args.period_ms.max(1))).await;
    Ok(serde_json::to_string_pretty(&summary)?)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    info!("case-sim v{} (core v{})", env!("CARGO_PKG_VERSION"), case_comms::VERSION);

    match simulate(&args).await {
        Ok(summary) => {
            println!("{}", summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
