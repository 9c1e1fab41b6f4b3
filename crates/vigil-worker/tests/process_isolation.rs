//! Integration tests for process isolation.
//!
//! Each test spawns the real `vigil-worker` binary and drives it through
//! `ProcessExecutor`, using the sample detectors compiled into the worker.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use vigil_core::detector::AnalysisRequest;
use vigil_core::execute::{ExecutorConfig, ProcessExecutor, RunStatus};
use vigil_core::ipc::{FaultCategory, StateBinding, WorkerInput, is_process_alive};
use vigil_core::loader::BuiltinResolver;
use vigil_core::{LoadErrorReason, ModulePackage, Outcome, ProcessError};

fn worker_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_vigil-worker"))
}

fn executor(grace_secs: u64) -> ProcessExecutor {
    ProcessExecutor::new(
        ExecutorConfig::default()
            .with_cancellation_grace(Duration::from_secs(grace_secs))
            .with_worker_path(worker_path()),
    )
}

/// Scratch space holding packages, state and working directories.
struct Fixture {
    temp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            temp: TempDir::new().unwrap(),
        }
    }

    /// A directory package whose entry type is one of the sample detectors.
    fn package(&self, id: &str, entry_type: &str) -> PathBuf {
        let dir = self.temp.path().join("packages").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        let manifest = json!({
            "id": id,
            "name": format!("{} detector", id),
            "version": "1.0.0",
            "mainCodeUnitName": "d1main",
            "entryTypeName": entry_type,
            "supportedResourceTypes": ["VirtualMachine"],
            "supportedCadences": [5, 60],
        });
        std::fs::write(dir.join("manifest.json"), manifest.to_string()).unwrap();
        std::fs::write(dir.join("d1main"), BuiltinResolver::shim("vigil-samples")).unwrap();
        dir
    }

    fn archive(&self, id: &str, entry_type: &str) -> PathBuf {
        let dir = self.package(id, entry_type);
        let archive = self.temp.path().join(format!("{}.tar.gz", id));
        ModulePackage::open(&dir)
            .unwrap()
            .write_archive(&archive)
            .unwrap();
        archive
    }

    fn input(&self, package: &Path, scope: &str, payload: Value) -> WorkerInput {
        WorkerInput {
            package_path: package.to_path_buf(),
            request: AnalysisRequest::new("vm-1", "VirtualMachine").with_payload(payload),
            state: StateBinding {
                root: self.temp.path().join("state"),
                run_scope_id: scope.to_string(),
            },
            work_root: self.work_root(),
            heartbeat_interval_ms: 0,
        }
    }

    fn work_root(&self) -> PathBuf {
        self.temp.path().join("work")
    }
}

async fn run(input: &WorkerInput) -> Result<Option<vigil_core::AnalysisResult>, ProcessError> {
    executor(5)
        .run_in_child_process(&worker_path(), input, CancellationToken::new())
        .await
}

#[tokio::test]
async fn test_echo_result_and_state_persist_across_runs() {
    let fixture = Fixture::new();
    let package = fixture.archive("echo", "Vigil.Samples.Echo");
    let input = fixture.input(&package, "scope-1", json!({ "message": "cpu high" }));

    let first = run(&input).await.unwrap().unwrap();
    assert_eq!(first.alerts[0].title, "cpu high");
    assert_eq!(first.alerts[0].properties["runs"], "1");

    let second = run(&input).await.unwrap().unwrap();
    assert_eq!(second.alerts[0].properties["runs"], "2");

    // Another run scope starts from scratch.
    let other = fixture.input(&package, "scope-2", json!({}));
    let third = run(&other).await.unwrap().unwrap();
    assert_eq!(third.alerts[0].properties["runs"], "1");
}

#[tokio::test]
async fn test_null_result_is_success() {
    let fixture = Fixture::new();
    let package = fixture.package("silent", "Vigil.Samples.Silent");
    let executor = executor(5);

    let result = executor
        .run_in_child_process(
            &worker_path(),
            &fixture.input(&package, "s", json!({})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(executor.status(), RunStatus::Completed);
    assert_eq!(executor.spawned_pids().len(), 1);
}

#[tokio::test]
async fn test_working_directories_are_removed() {
    let fixture = Fixture::new();
    let package = fixture.package("silent", "Vigil.Samples.Silent");
    run(&fixture.input(&package, "s", json!({}))).await.unwrap();

    let leftovers = std::fs::read_dir(fixture.work_root())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_module_error_is_forwarded() {
    let fixture = Fixture::new();
    let package = fixture.package("failing", "Vigil.Samples.Failing");
    let input = fixture.input(&package, "s", json!({ "message": "disk unreadable" }));

    match run(&input).await.unwrap_err() {
        ProcessError::Fault(fault) => {
            assert_eq!(fault.category, FaultCategory::Module);
            assert_eq!(fault.code, "SampleFailure");
            assert_eq!(fault.message, "disk unreadable");
        }
        other => panic!("expected fault, got {:?}", other),
    }
}

#[tokio::test]
async fn test_module_panic_is_forwarded() {
    let fixture = Fixture::new();
    let package = fixture.package("panicking", "Vigil.Samples.Panicking");

    match run(&fixture.input(&package, "s", json!({}))).await.unwrap_err() {
        ProcessError::Fault(fault) => {
            assert_eq!(fault.code, "Panicked");
            assert!(fault.message.contains("sample detector panicked"));
        }
        other => panic!("expected fault, got {:?}", other),
    }
}

#[tokio::test]
async fn test_crash_yields_no_result() {
    let fixture = Fixture::new();
    let package = fixture.package("crash", "Vigil.Samples.Crash");
    let executor = executor(5);

    let err = executor
        .run_in_child_process(
            &worker_path(),
            &fixture.input(&package, "s", json!({})),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::NoResult(_)));
    assert_eq!(err.outcome(), Outcome::ProcessCrash);
    assert_eq!(executor.status(), RunStatus::Failed);
}

#[tokio::test]
async fn test_load_failures_keep_their_reason() {
    let fixture = Fixture::new();
    let cases = [
        ("abstract", "Vigil.Samples.AbstractBase", LoadErrorReason::TypeAbstract),
        ("generic", "Vigil.Samples.Generic", LoadErrorReason::TypeGeneric),
        ("needsargs", "Vigil.Samples.NeedsArgs", LoadErrorReason::NoDefaultConstructor),
        ("helper", "Vigil.Samples.Helper", LoadErrorReason::TypeNotCapability),
        ("exploding", "Vigil.Samples.Exploding", LoadErrorReason::ConstructionFailed),
        ("missing", "Vigil.Samples.Missing", LoadErrorReason::TypeMissing),
    ];

    for (id, entry_type, reason) in cases {
        let package = fixture.package(id, entry_type);
        let err = run(&fixture.input(&package, "s", json!({}))).await.unwrap_err();
        assert_eq!(err.load_reason(), Some(reason), "{}", entry_type);
        assert_eq!(err.outcome(), Outcome::LoadFailure);
    }
}

#[tokio::test]
async fn test_cooperative_cancellation() {
    let fixture = Fixture::new();
    let package = fixture.package("coop", "Vigil.Samples.Cooperative");
    let executor = executor(5);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = executor
        .run_in_child_process(&worker_path(), &fixture.input(&package, "s", json!({})), cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Canceled), "got {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(executor.status(), RunStatus::Canceled);
}

#[tokio::test]
async fn test_stubborn_worker_is_terminated_after_grace() {
    let fixture = Fixture::new();
    let package = fixture.package("sleeper", "Vigil.Samples.Sleeper");
    let input = fixture.input(&package, "s", json!({ "sleep_secs": 100 }));
    let executor = executor(5);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let started = Instant::now();
    let err = executor
        .run_in_child_process(&worker_path(), &input, cancel)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        ProcessError::Terminated { pid, grace } => {
            assert_eq!(grace, Duration::from_secs(5));
            assert_eq!(executor.spawned_pids(), vec![pid]);
        }
        other => panic!("expected Terminated, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_millis(6500), "took {:?}", elapsed);
    assert_eq!(executor.status(), RunStatus::Canceled);
    for pid in executor.spawned_pids() {
        assert!(!is_process_alive(pid), "worker {} still alive", pid);
    }
}

#[tokio::test]
async fn test_heartbeats_do_not_disturb_result() {
    let fixture = Fixture::new();
    let package = fixture.package("sleeper", "Vigil.Samples.Sleeper");
    let mut input = fixture.input(&package, "s", json!({ "sleep_secs": 1 }));
    input.heartbeat_interval_ms = 50;

    assert!(run(&input).await.unwrap().is_none());
}

#[tokio::test]
async fn test_parallel_runs_are_independent() {
    let fixture = Fixture::new();
    let package = fixture.package("echo", "Vigil.Samples.Echo");
    let inputs: Vec<_> = (0..4)
        .map(|i| fixture.input(&package, &format!("scope-{}", i), json!({})))
        .collect();

    let (a, b, c, d) = tokio::join!(
        run(&inputs[0]),
        run(&inputs[1]),
        run(&inputs[2]),
        run(&inputs[3])
    );
    for result in [a, b, c, d] {
        assert_eq!(result.unwrap().unwrap().alerts[0].properties["runs"], "1");
    }
}

#[tokio::test]
async fn test_missing_worker_fails_to_start() {
    let fixture = Fixture::new();
    let package = fixture.package("silent", "Vigil.Samples.Silent");
    let executor = executor(5);

    let err = executor
        .run_in_child_process(
            Path::new("/definitely/not/here/vigil-worker"),
            &fixture.input(&package, "s", json!({})),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProcessError::Start { .. }));
    assert!(executor.spawned_pids().is_empty());
}
