//! Executor configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::Result;
use crate::ipc::{WORKER_PATH_ENV, find_worker_binary};

/// Grace time granted to a worker after a cancellation request.
pub const DEFAULT_CANCELLATION_GRACE: Duration = Duration::from_secs(5);

/// Lower bound for the cancellation grace time.
pub const MIN_CANCELLATION_GRACE: Duration = Duration::from_secs(1);

/// Environment variable overriding the grace time, in whole seconds.
pub const CANCELLATION_GRACE_ENV: &str = "VIGIL_CANCELLATION_GRACE_SECS";

/// Settings for [`ProcessExecutor`](super::ProcessExecutor).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// How long a canceled worker may take to exit before it is killed.
    pub cancellation_grace: Duration,
    /// Worker executable. Discovered on demand when unset.
    pub worker_path: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            cancellation_grace: DEFAULT_CANCELLATION_GRACE,
            worker_path: None,
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `VIGIL_CANCELLATION_GRACE_SECS` and
    /// `VIGIL_WORKER_PATH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var(CANCELLATION_GRACE_ENV) {
            match parse_grace_secs(&value) {
                Some(grace) => config = config.with_cancellation_grace(grace),
                None => tracing::warn!(
                    "Ignoring invalid {}={:?}, using {:?}",
                    CANCELLATION_GRACE_ENV,
                    value,
                    config.cancellation_grace
                ),
            }
        }
        if let Some(path) = std::env::var_os(WORKER_PATH_ENV) {
            config.worker_path = Some(PathBuf::from(path));
        }
        config
    }

    /// Set the grace time, clamped to [`MIN_CANCELLATION_GRACE`].
    pub fn with_cancellation_grace(mut self, grace: Duration) -> Self {
        self.cancellation_grace = grace.max(MIN_CANCELLATION_GRACE);
        self
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    /// The configured worker path, or the discovered one.
    pub fn resolve_worker_path(&self) -> Result<PathBuf> {
        match &self.worker_path {
            Some(path) => Ok(path.clone()),
            None => find_worker_binary(),
        }
    }
}

fn parse_grace_secs(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
