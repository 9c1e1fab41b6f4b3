//! Process-based executor for isolated detector runs.
//!
//! Every run gets a fresh worker process. The module's code never touches
//! the host process, so a crashing or hung detector can always be contained:
//! cooperative cancellation first, then a hard kill once the grace time is
//! spent.

use std::io;
use std::path::Path;
use std::process::ExitStatus;

use parking_lot::Mutex;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::detector::AnalysisResult;
use crate::error::ProcessError;
use crate::ipc::{
    Envelope, EnvelopeKind, WORKER_BINARY_NAME, WorkerFault, WorkerInput, WorkerProcess,
    read_envelope_async, write_envelope_async,
};

use super::config::ExecutorConfig;
use super::status::{RunStatus, StatusCell};

type ReadOutcome = std::result::Result<Option<Envelope>, String>;

/// Runs one detector invocation in a child process.
///
/// Use one executor per run. Executors are independent of one another, so
/// any number of runs may proceed concurrently.
pub struct ProcessExecutor {
    config: ExecutorConfig,
    status: StatusCell,
    spawned: Mutex<Vec<u32>>,
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            status: StatusCell::default(),
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Current lifecycle status of the run.
    pub fn status(&self) -> RunStatus {
        self.status.get()
    }

    /// Every worker pid this executor has started.
    pub fn spawned_pids(&self) -> Vec<u32> {
        self.spawned.lock().clone()
    }

    /// Run with the configured (or discovered) worker binary.
    pub async fn run(
        &self,
        input: &WorkerInput,
        cancel: CancellationToken,
    ) -> Result<Option<AnalysisResult>, ProcessError> {
        let worker_path = match self.config.resolve_worker_path() {
            Ok(path) => path,
            Err(e) => {
                self.status.advance(RunStatus::Failed);
                return Err(ProcessError::Start {
                    path: WORKER_BINARY_NAME.into(),
                    source: io::Error::new(io::ErrorKind::NotFound, e.to_string()),
                });
            }
        };
        self.run_in_child_process(&worker_path, input, cancel).await
    }

    /// Spawn `worker_path`, hand it `input` and wait for its result.
    ///
    /// Cancelling `cancel` sends the worker a cooperative cancel request.
    /// A worker that has not exited when the grace time runs out is killed.
    pub async fn run_in_child_process(
        &self,
        worker_path: &Path,
        input: &WorkerInput,
        cancel: CancellationToken,
    ) -> Result<Option<AnalysisResult>, ProcessError> {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        self.status.advance(RunStatus::Initializing);

        let start_error = |source: io::Error| ProcessError::Start {
            path: worker_path.to_path_buf(),
            source,
        };

        let input_envelope = match Envelope::json(&correlation_id, EnvelopeKind::Input, input) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.status.advance(RunStatus::Failed);
                return Err(start_error(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    e.to_string(),
                )));
            }
        };

        let mut worker = match WorkerProcess::spawn(worker_path, &correlation_id) {
            Ok(worker) => worker,
            Err(e) => {
                self.status.advance(RunStatus::Failed);
                return Err(start_error(e));
            }
        };
        let pid = worker.pid();
        self.spawned.lock().push(pid);
        self.status.advance(RunStatus::WaitingForExit);
        tracing::info!(pid, correlation_id = %correlation_id, "Started worker");

        // Writes to stdin may block on a worker that does not read, so they
        // run beside the select below instead of ahead of it.
        let writer = tokio::spawn(feed_worker(
            worker.take_stdin(),
            input_envelope,
            Envelope::signal(&correlation_id, EnvelopeKind::Cancel),
            cancel.clone(),
            pid,
        ));

        let Some(stdout) = worker.take_stdout() else {
            writer.abort();
            worker.kill().await;
            self.status.advance(RunStatus::Failed);
            return Err(ProcessError::NoResult("worker stdout unavailable".to_string()));
        };
        let mut reader = tokio::spawn(read_terminal_envelope(stdout, pid));

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = &mut reader => Some(joined),
        };

        match joined {
            None => self.cancel_worker(worker, writer, reader).await,
            Some(joined) => {
                writer.abort();
                let envelope = joined.unwrap_or_else(|e| Err(format!("reader task failed: {}", e)));
                self.finish(worker, envelope, &correlation_id).await
            }
        }
    }

    async fn cancel_worker(
        &self,
        mut worker: WorkerProcess,
        writer: JoinHandle<()>,
        reader: JoinHandle<ReadOutcome>,
    ) -> Result<Option<AnalysisResult>, ProcessError> {
        let pid = worker.pid();
        let grace = self.config.cancellation_grace;
        tracing::info!(pid, ?grace, "Cancellation requested, signaling worker");

        // The writer sends the cancel request on its own; only the exit is awaited.
        let exited = tokio::time::timeout(grace, worker.wait()).await;
        writer.abort();
        reader.abort();

        let exit = match exited {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!(pid, ?grace, "Worker ignored cancellation, killing it");
                worker.kill().await;
                self.status.advance(RunStatus::Canceled);
                return Err(ProcessError::Terminated { pid, grace });
            }
        };

        self.status.advance(RunStatus::Finalizing);
        match exit {
            Ok(status) if status.success() => {
                tracing::debug!(pid, "Worker exited within grace time");
                self.status.advance(RunStatus::Canceled);
                Err(ProcessError::Canceled)
            }
            Ok(status) => {
                tracing::info!(pid, %status, "Worker crashed while canceling");
                self.status.advance(RunStatus::Failed);
                Err(ProcessError::NoResult(format!(
                    "worker exited during cancellation ({})",
                    status
                )))
            }
            Err(e) => {
                tracing::warn!(pid, "Failed to wait for worker: {}", e);
                self.status.advance(RunStatus::Failed);
                Err(ProcessError::NoResult(format!(
                    "worker exit status unknown after cancellation: {}",
                    e
                )))
            }
        }
    }

    async fn finish(
        &self,
        mut worker: WorkerProcess,
        envelope: ReadOutcome,
        correlation_id: &str,
    ) -> Result<Option<AnalysisResult>, ProcessError> {
        let pid = worker.pid();
        let grace = self.config.cancellation_grace;

        let exit = match tokio::time::timeout(grace, worker.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(pid, "Failed to wait for worker: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!(pid, ?grace, "Worker did not exit after its result, killing it");
                worker.kill().await;
                None
            }
        };
        self.status.advance(RunStatus::Finalizing);

        let result = interpret(envelope, correlation_id, exit);
        match &result {
            Ok(_) => {
                tracing::info!(pid, "Worker completed");
                self.status.advance(RunStatus::Completed);
            }
            Err(e) => {
                tracing::info!(pid, "Worker failed: {}", e);
                self.status.advance(RunStatus::Failed);
            }
        }
        result
    }
}

/// Send the input, then the cancel request once `cancel` fires.
///
/// Returning drops stdin, which closes the pipe.
async fn feed_worker(
    stdin: Option<ChildStdin>,
    input: Envelope,
    cancel_request: Envelope,
    cancel: CancellationToken,
    pid: u32,
) {
    let Some(mut stdin) = stdin else {
        return;
    };
    if let Err(e) = write_envelope_async(&mut stdin, &input).await {
        // The worker is already gone; the reader reports what it left behind.
        tracing::debug!(pid, "Failed to send input: {}", e);
        return;
    }
    cancel.cancelled().await;
    if let Err(e) = write_envelope_async(&mut stdin, &cancel_request).await {
        tracing::debug!(pid, "Failed to send cancel: {}", e);
    }
}

/// Read envelopes until the terminal one, skipping heartbeats.
async fn read_terminal_envelope(mut stdout: ChildStdout, pid: u32) -> ReadOutcome {
    loop {
        match read_envelope_async(&mut stdout).await {
            Ok(Some(envelope)) if envelope.kind == EnvelopeKind::Heartbeat => {
                tracing::debug!(pid, "Worker heartbeat");
            }
            Ok(Some(envelope)) if envelope.kind.is_terminal() => return Ok(Some(envelope)),
            Ok(Some(envelope)) => {
                return Err(format!("unexpected {:?} envelope from worker", envelope.kind));
            }
            Ok(None) => return Ok(None),
            Err(e) => return Err(format!("unreadable worker output: {}", e)),
        }
    }
}

/// Turn the worker's terminal envelope into the run's result.
fn interpret(
    envelope: ReadOutcome,
    correlation_id: &str,
    exit: Option<ExitStatus>,
) -> Result<Option<AnalysisResult>, ProcessError> {
    let envelope = match envelope {
        Ok(Some(envelope)) => envelope,
        Ok(None) => {
            return Err(ProcessError::NoResult(format!(
                "worker exited without writing a result ({})",
                describe_exit(exit)
            )));
        }
        Err(message) => return Err(ProcessError::NoResult(message)),
    };

    if let Some(status) = exit
        && !status.success()
    {
        return Err(ProcessError::NoResult(format!(
            "worker wrote a result but {}",
            status
        )));
    }
    if envelope.correlation_id != correlation_id {
        return Err(ProcessError::NoResult(format!(
            "correlation id mismatch: expected {}, got {}",
            correlation_id, envelope.correlation_id
        )));
    }

    match envelope.kind {
        EnvelopeKind::Output => envelope
            .decode::<Option<AnalysisResult>>()
            .map_err(|e| ProcessError::NoResult(format!("unparsable output: {}", e))),
        EnvelopeKind::Error => {
            let fault: WorkerFault = envelope
                .decode()
                .map_err(|e| ProcessError::NoResult(format!("unparsable fault: {}", e)))?;
            Err(ProcessError::Fault(fault.bounded()))
        }
        kind => Err(ProcessError::NoResult(format!(
            "unexpected {:?} envelope from worker",
            kind
        ))),
    }
}

fn describe_exit(exit: Option<ExitStatus>) -> String {
    match exit {
        Some(status) => status.to_string(),
        None => "exit status unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::AnalysisRequest;
    use crate::ipc::protocol::MAX_FAULT_MESSAGE_CHARS;
    use crate::ipc::{FaultCategory, StateBinding};

    const CID: &str = "cid-1";

    fn ok_exit() -> Option<ExitStatus> {
        None
    }

    #[test]
    fn test_interpret_output() {
        let result = AnalysisResult::default();
        let envelope = Envelope::json(CID, EnvelopeKind::Output, &Some(&result)).unwrap();
        assert_eq!(
            interpret(Ok(Some(envelope)), CID, ok_exit()).unwrap(),
            Some(result)
        );
    }

    #[test]
    fn test_interpret_null_output() {
        let envelope =
            Envelope::json(CID, EnvelopeKind::Output, &None::<AnalysisResult>).unwrap();
        assert_eq!(interpret(Ok(Some(envelope)), CID, ok_exit()).unwrap(), None);
    }

    #[test]
    fn test_interpret_fault_is_bounded() {
        let fault = WorkerFault {
            category: FaultCategory::Module,
            code: "Boom".to_string(),
            message: "x".repeat(10_000),
        };
        let envelope = Envelope::json(CID, EnvelopeKind::Error, &fault).unwrap();
        match interpret(Ok(Some(envelope)), CID, ok_exit()) {
            Err(ProcessError::Fault(fault)) => {
                assert_eq!(fault.code, "Boom");
                assert!(fault.message.chars().count() <= MAX_FAULT_MESSAGE_CHARS + 1);
            }
            other => panic!("expected fault, got {:?}", other),
        }
    }

    #[test]
    fn test_interpret_missing_envelope() {
        assert!(matches!(
            interpret(Ok(None), CID, ok_exit()),
            Err(ProcessError::NoResult(_))
        ));
        assert!(matches!(
            interpret(Err("garbage".to_string()), CID, ok_exit()),
            Err(ProcessError::NoResult(_))
        ));
    }

    #[test]
    fn test_interpret_correlation_mismatch() {
        let envelope =
            Envelope::json("other", EnvelopeKind::Output, &None::<AnalysisResult>).unwrap();
        match interpret(Ok(Some(envelope)), CID, ok_exit()) {
            Err(ProcessError::NoResult(message)) => assert!(message.contains("mismatch")),
            other => panic!("expected NoResult, got {:?}", other),
        }
    }

    #[test]
    fn test_interpret_unparsable_output() {
        let envelope = Envelope {
            correlation_id: CID.to_string(),
            kind: EnvelopeKind::Output,
            payload: b"{not json".to_vec(),
        };
        assert!(matches!(
            interpret(Ok(Some(envelope)), CID, ok_exit()),
            Err(ProcessError::NoResult(_))
        ));
    }

    fn input() -> WorkerInput {
        WorkerInput {
            package_path: "/nonexistent/pkg".into(),
            request: AnalysisRequest::new("vm-1", "VirtualMachine"),
            state: StateBinding {
                root: "/nonexistent/state".into(),
                run_scope_id: "scope".to_string(),
            },
            work_root: "/nonexistent/work".into(),
            heartbeat_interval_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_missing_worker_is_start_error() {
        let executor = ProcessExecutor::new(ExecutorConfig::default());
        let err = executor
            .run_in_child_process(
                Path::new("/definitely/not/here/vigil-worker"),
                &input(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessError::Start { .. }));
        assert_eq!(executor.status(), RunStatus::Failed);
        assert!(executor.spawned_pids().is_empty());
    }

    #[cfg(unix)]
    mod scripted {
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use std::time::{Duration, Instant};

        use tempfile::TempDir;

        use super::*;
        use crate::ipc::is_process_alive;

        fn script(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("worker.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn executor() -> ProcessExecutor {
            ProcessExecutor::new(
                ExecutorConfig::default().with_cancellation_grace(Duration::from_secs(1)),
            )
        }

        #[tokio::test]
        async fn test_silent_exit_is_no_result() {
            let dir = TempDir::new().unwrap();
            let worker = script(&dir, "exit 0");
            let executor = executor();

            let err = executor
                .run_in_child_process(&worker, &input(), CancellationToken::new())
                .await
                .unwrap_err();

            assert!(matches!(err, ProcessError::NoResult(_)));
            assert_eq!(executor.status(), RunStatus::Failed);
            assert_eq!(executor.spawned_pids().len(), 1);
        }

        #[tokio::test]
        async fn test_worker_exiting_on_cancel_is_canceled() {
            let dir = TempDir::new().unwrap();
            let worker = script(&dir, "exec cat > /dev/null");
            let executor = executor();
            let cancel = CancellationToken::new();
            cancel.cancel();

            let err = executor
                .run_in_child_process(&worker, &input(), cancel)
                .await
                .unwrap_err();

            assert!(matches!(err, ProcessError::Canceled));
            assert_eq!(executor.status(), RunStatus::Canceled);
        }

        #[tokio::test]
        async fn test_crash_during_cancel_is_no_result() {
            let dir = TempDir::new().unwrap();
            let worker = script(&dir, "read x\nexit 3");
            let executor = executor();
            let cancel = CancellationToken::new();
            cancel.cancel();

            let err = executor
                .run_in_child_process(&worker, &input(), cancel)
                .await
                .unwrap_err();

            match err {
                ProcessError::NoResult(message) => assert!(message.contains("cancellation")),
                other => panic!("expected NoResult, got {:?}", other),
            }
            assert_eq!(executor.status(), RunStatus::Failed);
        }

        #[tokio::test]
        async fn test_cancel_while_input_is_blocked() {
            let dir = TempDir::new().unwrap();
            let worker = script(&dir, "exec sleep 30");
            let executor = executor();
            let cancel = CancellationToken::new();

            // Far more than a pipe buffer, and the worker never reads it.
            let mut large = input();
            large.request = large
                .request
                .with_payload(serde_json::Value::String("x".repeat(1 << 20)));

            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let result = tokio::time::timeout(
                Duration::from_secs(8),
                executor.run_in_child_process(&worker, &large, cancel),
            )
            .await
            .expect("cancellation was not observed");

            match result {
                Err(ProcessError::Terminated { pid, .. }) => assert!(!is_process_alive(pid)),
                other => panic!("expected Terminated, got {:?}", other),
            }
            assert!(started.elapsed() < Duration::from_secs(3));
            assert_eq!(executor.status(), RunStatus::Canceled);
        }

        #[tokio::test]
        async fn test_worker_ignoring_cancel_is_terminated() {
            let dir = TempDir::new().unwrap();
            let worker = script(&dir, "exec sleep 30");
            let executor = executor();
            let cancel = CancellationToken::new();

            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let started = Instant::now();
            let err = executor
                .run_in_child_process(&worker, &input(), cancel)
                .await
                .unwrap_err();

            match err {
                ProcessError::Terminated { pid, grace } => {
                    assert_eq!(grace, Duration::from_secs(1));
                    assert_eq!(executor.spawned_pids(), vec![pid]);
                    assert!(!is_process_alive(pid));
                }
                other => panic!("expected Terminated, got {:?}", other),
            }
            assert!(started.elapsed() < Duration::from_secs(5));
            assert_eq!(executor.status(), RunStatus::Canceled);
        }
    }
}
