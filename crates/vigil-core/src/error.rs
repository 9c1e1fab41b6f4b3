//! Error types for vigil-core.
//!
//! Failures are grouped in three families that match the three runtime
//! components: [`LoadError`] (package and type resolution),
//! [`ProcessError`] (worker lifecycle) and [`StateError`] (state repository).
//! [`Error`] wraps all of them for callers that do not care which part failed.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ipc::{FaultCategory, WorkerFault};
use crate::package::PackageError;

/// Result type for vigil-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in vigil-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Package could not be read or is malformed.
    #[error("package error: {0}")]
    Package(#[from] PackageError),

    /// Package or entry type could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Worker process failed, was canceled or was killed.
    #[error(transparent)]
    Process(#[from] ProcessError),

    /// State repository operation failed.
    #[error(transparent)]
    State(#[from] StateError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IPC communication error with worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map this error onto the user-visible outcome category.
    pub fn outcome(&self) -> Outcome {
        match self {
            Error::Package(_) | Error::Load(_) => Outcome::LoadFailure,
            Error::Process(e) => e.outcome(),
            Error::State(_) => Outcome::StateFailure,
            Error::Serialization(_) | Error::Ipc(_) | Error::Io(_) => Outcome::ProcessCrash,
        }
    }
}

/// The failure categories a caller of the runtime can observe.
///
/// Together with a successful result these cover every outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The worker honored a cancellation request.
    Canceled,
    /// The worker ignored cancellation and was killed.
    Terminated,
    /// The package or its entry type could not be loaded.
    LoadFailure,
    /// The worker crashed, could not start, or the module raised an error.
    ProcessCrash,
    /// The module's state could not be stored or read.
    StateFailure,
}

/// Why a package could not be turned into a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadErrorReason {
    PackageCorrupt,
    MainUnitMissing,
    TypeMissing,
    TypeNotCapability,
    TypeAbstract,
    TypeGeneric,
    NoDefaultConstructor,
    ConstructionFailed,
}

impl LoadErrorReason {
    /// Stable reason code used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PackageCorrupt => "PackageCorrupt",
            Self::MainUnitMissing => "MainUnitMissing",
            Self::TypeMissing => "TypeMissing",
            Self::TypeNotCapability => "TypeNotCapability",
            Self::TypeAbstract => "TypeAbstract",
            Self::TypeGeneric => "TypeGeneric",
            Self::NoDefaultConstructor => "NoDefaultConstructor",
            Self::ConstructionFailed => "ConstructionFailed",
        }
    }

    /// Parse a reason code produced by [`as_str`](Self::as_str).
    pub fn from_code(code: &str) -> Option<Self> {
        [
            Self::PackageCorrupt,
            Self::MainUnitMissing,
            Self::TypeMissing,
            Self::TypeNotCapability,
            Self::TypeAbstract,
            Self::TypeGeneric,
            Self::NoDefaultConstructor,
            Self::ConstructionFailed,
        ]
        .into_iter()
        .find(|reason| reason.as_str() == code)
    }
}

impl fmt::Display for LoadErrorReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A package failed to load.
///
/// Carries the manifest identity for diagnostics but never the underlying
/// fault's call stack.
#[derive(Debug, Clone, Error)]
#[error("failed to load module '{manifest_name}' ({manifest_id}): {reason}: {message}")]
pub struct LoadError {
    pub reason: LoadErrorReason,
    pub manifest_id: String,
    pub manifest_name: String,
    pub message: String,
}

impl LoadError {
    pub fn new(
        reason: LoadErrorReason,
        manifest_id: impl Into<String>,
        manifest_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            reason,
            manifest_id: manifest_id.into(),
            manifest_name: manifest_name.into(),
            message: message.into(),
        }
    }
}

/// Errors from running a module in a worker process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The worker executable could not be started.
    #[error("failed to start worker process '{}': {source}", path.display())]
    Start {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker reported an error raised while loading or running the module.
    #[error("worker reported {}: {} ({})", .0.category, .0.code, .0.message)]
    Fault(WorkerFault),

    /// The worker honored a cancellation request.
    #[error("worker run was canceled")]
    Canceled,

    /// The worker ignored cancellation and was killed by the parent.
    #[error("worker process {pid} terminated by parent after {grace:?} cancellation grace time")]
    Terminated { pid: u32, grace: Duration },

    /// The worker exited without writing a usable result.
    #[error("child process returned empty/invalid result: {0}")]
    NoResult(String),
}

impl ProcessError {
    /// Map this error onto the user-visible outcome category.
    pub fn outcome(&self) -> Outcome {
        match self {
            ProcessError::Start { .. } | ProcessError::NoResult(_) => Outcome::ProcessCrash,
            ProcessError::Canceled => Outcome::Canceled,
            ProcessError::Terminated { .. } => Outcome::Terminated,
            ProcessError::Fault(fault) => match fault.category {
                FaultCategory::Load => Outcome::LoadFailure,
                FaultCategory::State => Outcome::StateFailure,
                FaultCategory::Canceled => Outcome::Canceled,
                FaultCategory::Module | FaultCategory::Protocol => Outcome::ProcessCrash,
            },
        }
    }

    /// The load reason code, if the worker failed to load the package.
    pub fn load_reason(&self) -> Option<LoadErrorReason> {
        match self {
            ProcessError::Fault(fault) if fault.category == FaultCategory::Load => {
                LoadErrorReason::from_code(&fault.code)
            }
            _ => None,
        }
    }
}

/// Errors from the state repository.
#[derive(Debug, Error)]
pub enum StateError {
    /// The serialized value exceeds the configured payload cap.
    #[error("state for key '{key}' is too big: {size} bytes exceeds the limit of {limit} bytes")]
    TooBig { key: String, size: usize, limit: usize },

    /// The value could not be encoded, or a stored payload could not be decoded.
    #[error("state for key '{key}' could not be serialized: {message}")]
    Serialization { key: String, message: String },

    /// Writing to the backing store failed.
    #[error("failed to save state for key '{key}': {source}")]
    Save {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading from the backing store failed.
    #[error("failed to load state for key '{key}': {source}")]
    Load {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Removing from the backing store failed.
    #[error("failed to delete state for key '{key}': {source}")]
    Delete {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// The caller's cancellation token fired before the operation ran.
    #[error("state operation on key '{key}' was canceled")]
    Canceled { key: String },
}

impl StateError {
    /// Stable reason code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            StateError::TooBig { .. } => "StateTooBig",
            StateError::Serialization { .. } => "StateSerialization",
            StateError::Save { .. } => "StateSave",
            StateError::Load { .. } => "StateLoad",
            StateError::Delete { .. } => "StateDelete",
            StateError::Canceled { .. } => "StateCanceled",
        }
    }
}
