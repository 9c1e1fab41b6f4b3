//! Run command implementation for Vigil CLI.
//!
//! Runs a package once in a worker process and prints its findings.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use vigil_core::detector::AnalysisRequest;
use vigil_core::execute::{ExecutorConfig, ProcessExecutor};
use vigil_core::ipc::{StateBinding, WorkerInput};
use vigil_core::{ModulePackage, Outcome, VigilDirs};

use crate::colors;

pub struct RunOptions {
    pub package: PathBuf,
    pub request: PathBuf,
    pub scope: String,
    pub grace: Option<u64>,
    pub timeout: Option<u64>,
    pub worker: Option<PathBuf>,
    pub heartbeat_ms: u64,
}

/// Short label for a failure category.
pub fn outcome_label(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Canceled => "canceled",
        Outcome::Terminated => "terminated by parent",
        Outcome::LoadFailure => "load failure",
        Outcome::ProcessCrash => "process crash",
        Outcome::StateFailure => "state failure",
    }
}

/// Run a package.
pub async fn execute(dirs: &VigilDirs, options: RunOptions) -> anyhow::Result<()> {
    let start = Instant::now();

    let request_bytes = std::fs::read(&options.request)
        .with_context(|| format!("failed to read request {}", options.request.display()))?;
    let request: AnalysisRequest = serde_json::from_slice(&request_bytes)
        .with_context(|| format!("invalid request {}", options.request.display()))?;

    let mut config = ExecutorConfig::from_env();
    if let Some(grace) = options.grace {
        config = config.with_cancellation_grace(Duration::from_secs(grace));
    }
    if let Some(worker) = options.worker {
        config = config.with_worker_path(worker);
    }

    let package_path = std::path::absolute(&options.package)?;
    if let Some(manifest) = ModulePackage::peek_manifest(&package_path) {
        println!(
            "{}Running{} {} {} ({}) on {}",
            colors::BOLD,
            colors::RESET,
            manifest.name,
            manifest.version,
            manifest.id,
            request.resource_id
        );
    }

    let input = WorkerInput {
        package_path,
        request,
        state: StateBinding {
            root: dirs.state_dir.clone(),
            run_scope_id: options.scope,
        },
        work_root: dirs.work_dir.clone(),
        heartbeat_interval_ms: options.heartbeat_ms,
    };

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(&cancel, options.timeout);

    let executor = ProcessExecutor::new(config);
    let result = executor
        .run(&input, cancel)
        .await
        .map_err(vigil_core::Error::from)?;

    match result {
        Some(result) if !result.alerts.is_empty() => {
            println!("\n{}Alerts:{}", colors::BOLD, colors::RESET);
            println!("{}", "─".repeat(50));
            for alert in &result.alerts {
                println!(
                    "{}{:?}{} {} {}({}){}",
                    colors::YELLOW,
                    alert.severity,
                    colors::RESET,
                    alert.title,
                    colors::DIM,
                    alert.resource_id,
                    colors::RESET
                );
                if !alert.description.is_empty() {
                    println!("    {}", alert.description);
                }
                for (name, value) in &alert.properties {
                    println!("    {}{}{} = {}", colors::CYAN, name, colors::RESET, value);
                }
            }
        }
        _ => println!("\n{}No findings.{}", colors::YELLOW, colors::RESET),
    }

    println!("\n{}", "─".repeat(50));
    println!(
        "{}Completed{} in {:.2}s",
        colors::GREEN,
        colors::RESET,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Cancel on Ctrl-C, and after `timeout_secs` when given.
fn spawn_cancel_triggers(cancel: &CancellationToken, timeout_secs: Option<u64>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}Interrupted, canceling run...{}", colors::RED, colors::RESET);
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout_secs {
        let on_timeout = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            tracing::warn!("Run timed out after {}s, canceling", secs);
            on_timeout.cancel();
        });
    }
}
