//! Inter-process communication for Vigil worker processes.
//!
//! This module provides the envelope protocol and the handle used to
//! spawn and talk to isolated worker processes.

pub mod protocol;
mod worker;

pub use protocol::{
    Envelope, EnvelopeKind, FaultCategory, StateBinding, WorkerFault, WorkerInput,
    read_envelope, read_envelope_async, write_envelope, write_envelope_async,
};
pub use worker::{
    WORKER_BINARY_NAME, WORKER_PATH_ENV, WorkerProcess, find_worker_binary, is_process_alive,
};
