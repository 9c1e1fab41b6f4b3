//! One detector run inside the worker.
//!
//! The main thread owns the detector. A monitor thread watches stdin for a
//! cancel request, and an optional heartbeat thread shares stdout with the
//! main thread.

use std::io::{self, Stdout};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;
use vigil_core::detector::{AnalysisContext, AnalysisResult, DetectorError, TracingTracer};
use vigil_core::ipc::{
    Envelope, EnvelopeKind, FaultCategory, WorkerFault, WorkerInput, read_envelope, write_envelope,
};
use vigil_core::loader::{DylibResolver, Loader, panic_message};
use vigil_core::state::{FileBlobStore, StateRepository};

use crate::builtin;

type SharedStdout = Arc<Mutex<Stdout>>;

/// Read the input, run the detector and write the terminal envelope.
///
/// Returns an error only when no terminal envelope could be written.
pub fn run(correlation_id: &str) -> anyhow::Result<()> {
    let input_envelope = read_envelope(&mut io::stdin().lock())
        .context("failed to read input envelope")?
        .ok_or_else(|| anyhow!("parent closed stdin before sending input"))?;

    let stdout: SharedStdout = Arc::new(Mutex::new(io::stdout()));

    let input = match parse_input(&input_envelope, correlation_id) {
        Ok(input) => input,
        Err(fault) => {
            tracing::warn!("Rejecting input: {}", fault.message);
            return respond(&stdout, correlation_id, Err(fault));
        }
    };

    let cancel = CancellationToken::new();
    spawn_stdin_monitor(correlation_id.to_string(), cancel.clone())?;

    let heartbeat = match input.heartbeat_interval_ms {
        0 => None,
        ms => Some(Heartbeat::start(
            stdout.clone(),
            correlation_id.to_string(),
            Duration::from_millis(ms),
        )?),
    };

    let outcome = execute(&input, &cancel);

    if let Some(heartbeat) = heartbeat {
        heartbeat.stop();
    }
    respond(&stdout, correlation_id, outcome)
}

fn parse_input(envelope: &Envelope, correlation_id: &str) -> Result<WorkerInput, WorkerFault> {
    if envelope.correlation_id != correlation_id {
        return Err(WorkerFault::new(
            FaultCategory::Protocol,
            "CorrelationMismatch",
            format!(
                "input carries correlation id {}, expected {}",
                envelope.correlation_id, correlation_id
            ),
        ));
    }
    if envelope.kind != EnvelopeKind::Input {
        return Err(WorkerFault::new(
            FaultCategory::Protocol,
            "UnexpectedEnvelope",
            format!("expected Input envelope, got {:?}", envelope.kind),
        ));
    }
    envelope
        .decode()
        .map_err(|e| WorkerFault::new(FaultCategory::Protocol, "InvalidInput", e.to_string()))
}

/// Load the package and run its detector once.
fn execute(
    input: &WorkerInput,
    cancel: &CancellationToken,
) -> Result<Option<AnalysisResult>, WorkerFault> {
    let loader = Loader::new(&input.work_root)
        .with_resolver(builtin::resolver())
        .with_resolver(DylibResolver);

    let mut module = loader.load_path(&input.package_path).map_err(|e| {
        WorkerFault::new(FaultCategory::Load, e.reason.as_str(), e.to_string())
    })?;
    let manifest = module.manifest().clone();
    let request = &input.request;

    if !manifest.supports_resource_type(&request.resource_type) {
        tracing::warn!(
            "Module '{}' does not declare resource type '{}'",
            manifest.id,
            request.resource_type
        );
    }

    let store = FileBlobStore::new(&input.state.root).map_err(|e| {
        WorkerFault::new(FaultCategory::State, "StateUnavailable", e.to_string())
    })?;
    let state = StateRepository::new(Arc::new(store), &manifest.id, &input.state.run_scope_id);
    let tracer = TracingTracer::new(&manifest.id);
    let ctx = AnalysisContext::new(&tracer, cancel, &state);

    tracing::info!(module = %manifest.id, resource = %request.resource_id, "Running detector");
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| module.analyze(request, &ctx)));

    let result = match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(detector_fault(e)),
        Err(panic) => Err(WorkerFault::new(
            FaultCategory::Module,
            "Panicked",
            panic_message(panic.as_ref()),
        )),
    };

    if let Err(e) = module.cleanup() {
        tracing::warn!("Failed to clean up module '{}': {}", manifest.id, e);
    }
    result
}

fn detector_fault(error: DetectorError) -> WorkerFault {
    match error {
        DetectorError::Canceled => {
            WorkerFault::new(FaultCategory::Canceled, "Canceled", "analysis canceled")
        }
        DetectorError::Failed { code, message } => {
            WorkerFault::new(FaultCategory::Module, code, message)
        }
        DetectorError::State(e) => WorkerFault::new(FaultCategory::State, e.code(), e.to_string()),
    }
}

fn respond(
    stdout: &SharedStdout,
    correlation_id: &str,
    outcome: Result<Option<AnalysisResult>, WorkerFault>,
) -> anyhow::Result<()> {
    let envelope = match &outcome {
        Ok(result) => Envelope::json(correlation_id, EnvelopeKind::Output, result),
        Err(fault) => Envelope::json(correlation_id, EnvelopeKind::Error, fault),
    }
    .context("failed to encode result")?;

    let mut out = stdout
        .lock()
        .map_err(|_| anyhow!("stdout lock poisoned"))?;
    write_envelope(&mut *out, &envelope).context("failed to write result")?;
    Ok(())
}

/// Cancel the run when the parent asks for it or goes away.
fn spawn_stdin_monitor(correlation_id: String, cancel: CancellationToken) -> io::Result<()> {
    thread::Builder::new()
        .name("stdin-monitor".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            loop {
                match read_envelope(&mut stdin) {
                    Ok(Some(envelope))
                        if envelope.kind == EnvelopeKind::Cancel
                            && envelope.correlation_id == correlation_id =>
                    {
                        tracing::info!("Cancellation requested by parent");
                        break;
                    }
                    Ok(Some(envelope)) => {
                        tracing::debug!("Ignoring {:?} envelope from parent", envelope.kind);
                    }
                    Ok(None) => {
                        tracing::debug!("Parent closed stdin");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Unreadable message from parent: {}", e);
                        break;
                    }
                }
            }
            cancel.cancel();
        })?;
    Ok(())
}

/// Periodic liveness envelopes on stdout.
struct Heartbeat {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl Heartbeat {
    fn start(stdout: SharedStdout, correlation_id: String, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stopped) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let beat = Envelope::signal(&correlation_id, EnvelopeKind::Heartbeat);
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    let Ok(mut out) = stdout.lock() else { return };
                    if let Err(e) = write_envelope(&mut *out, &beat) {
                        tracing::debug!("Heartbeat failed, stopping: {}", e);
                        return;
                    }
                }
            })?;
        Ok(Self { stop_tx, thread })
    }

    /// Stop beating. No heartbeat is written after this returns.
    fn stop(self) {
        drop(self.stop_tx);
        if self.thread.join().is_err() {
            tracing::warn!("Heartbeat thread panicked");
        }
    }
}
