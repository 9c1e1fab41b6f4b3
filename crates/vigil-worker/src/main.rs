//! Vigil worker process.
//!
//! Loads one detector package, runs it once and reports the outcome to the
//! parent as a single envelope on stdout. Everything else the worker has to
//! say goes to stderr.

mod builtin;
mod runner;

use std::process::ExitCode;

use clap::Parser;

/// Environment variable holding the worker's log filter.
const LOG_ENV: &str = "VIGIL_LOG";

#[derive(Parser)]
#[command(name = "vigil-worker")]
#[command(about = "Isolated worker process for Vigil detectors")]
#[command(version)]
struct Args {
    /// Correlation token issued by the parent for this run
    correlation_id: String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // stdout is the protocol channel, so logs must go to stderr
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    match runner::run(&args.correlation_id) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Worker failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
