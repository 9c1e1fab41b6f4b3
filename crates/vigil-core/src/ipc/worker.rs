//! Worker process handles.
//!
//! Provides `WorkerProcess` for spawning and talking to one isolated worker,
//! plus lookup of the worker binary and OS-level liveness checks.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{Error, Result};

/// Name of the worker executable on this platform.
pub const WORKER_BINARY_NAME: &str = if cfg!(windows) {
    "vigil-worker.exe"
} else {
    "vigil-worker"
};

/// Environment variable overriding the worker binary location.
pub const WORKER_PATH_ENV: &str = "VIGIL_WORKER_PATH";

/// Handle to a running worker process.
pub struct WorkerProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    pid: u32,
}

impl WorkerProcess {
    /// Spawn `worker_path <correlation_id>` with piped standard streams.
    ///
    /// Worker stderr is forwarded line by line to `tracing`; it is never
    /// interpreted. The process is killed if the handle is dropped.
    pub fn spawn(worker_path: &Path, correlation_id: &str) -> std::io::Result<Self> {
        let mut child = Command::new(worker_path)
            .arg(correlation_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| std::io::Error::other("worker exited before reporting a pid"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(worker_pid = pid, "{}", line);
                }
            });
        }

        Ok(Self {
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            pid,
        })
    }

    /// Process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take ownership of the worker's stdin for sending envelopes.
    ///
    /// Dropping it closes the pipe; the worker sees end of input.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take ownership of the worker's stdout for reading envelopes.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Wait for the worker to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the worker immediately and reap it.
    ///
    /// This needs no cooperation from the module, so it also stops a worker
    /// stuck in a blocking call.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // InvalidInput means the process has already been reaped
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker {}: {}", self.pid, e);
            }
        }
        // Wait to reap zombie
        let _ = self.child.wait().await;
    }
}

/// Find the vigil-worker binary.
///
/// Looks in the following order:
/// 1. `VIGIL_WORKER_PATH` environment variable
/// 2. Same directory as the current executable (and its parent, for test binaries)
/// 3. System PATH
/// 4. `target/debug` or `target/release` of this workspace
pub fn find_worker_binary() -> Result<PathBuf> {
    // 1. Check environment variable
    if let Ok(path) = std::env::var(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    // 2. Look next to current executable
    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for dir in [Some(exe_dir), exe_dir.parent()].into_iter().flatten() {
            let worker_path = dir.join(WORKER_BINARY_NAME);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    // 3. Try system PATH via which
    if let Ok(path) = which::which(WORKER_BINARY_NAME) {
        return Ok(path);
    }

    // 4. For development: try target/debug or target/release
    let workspace_root = Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..");
    for profile in ["debug", "release"] {
        let path = workspace_root.join("target").join(profile).join(WORKER_BINARY_NAME);
        if path.exists() {
            return Ok(path.canonicalize().unwrap_or(path));
        }
    }

    Err(Error::Ipc(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_BINARY_NAME, WORKER_PATH_ENV
    )))
}

/// Whether a process with this pid is still running.
///
/// Zombies count as not running.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let exists = unsafe { libc::kill(pid as libc::pid_t, 0) } == 0;
    if !exists {
        return false;
    }
    // A reaped-but-not-waited child would still answer signal 0.
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid));
    match stat {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    false
}
