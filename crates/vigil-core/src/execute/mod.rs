//! Running detectors in isolated worker processes.

mod config;
mod process;
mod status;

pub use config::{
    CANCELLATION_GRACE_ENV, DEFAULT_CANCELLATION_GRACE, ExecutorConfig, MIN_CANCELLATION_GRACE,
};
pub use process::ProcessExecutor;
pub use status::RunStatus;
