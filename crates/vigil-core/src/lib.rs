//! Core runtime for Vigil detector modules.
//!
//! This crate provides:
//! - Module packages and their manifests
//! - The loader that turns a package into a live [`Detector`]
//! - Process isolation for detector runs, with cooperative and forced
//!   cancellation
//! - The per-module, per-scope state repository

pub mod detector;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod loader;
pub mod package;
pub mod paths;
pub mod state;

pub use detector::{
    Alert, AnalysisContext, AnalysisRequest, AnalysisResult, Detector, DetectorError, Severity,
    TraceLevel, Tracer, TracingTracer,
};
pub use error::{
    Error, LoadError, LoadErrorReason, Outcome, ProcessError, Result, StateError,
};
pub use execute::{ExecutorConfig, ProcessExecutor, RunStatus};
pub use ipc::{StateBinding, WorkerFault, WorkerInput};
pub use loader::{
    BuiltinResolver, CodeUnit, CodeUnitResolver, DylibResolver, LoadedModule, Loader,
    TypeDescriptor,
};
pub use package::{ManifestError, ModuleManifest, ModulePackage, ModuleVersion, PackageError};
pub use paths::{ScopedWorkDir, VigilDirs};
pub use state::{BlobStore, FileBlobStore, MemoryBlobStore, StateRepository};
