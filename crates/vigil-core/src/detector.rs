//! The detector capability and the values that flow through it.
//!
//! A detector is the pluggable analysis unit hosted by the runtime. It is
//! handed one [`AnalysisRequest`] per run together with an
//! [`AnalysisContext`] for tracing, cancellation and state, and returns an
//! optional [`AnalysisResult`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::StateError;
use crate::state::StateRepository;

/// The single capability every module entry type must implement.
pub trait Detector: Send {
    /// Analyze one resource.
    ///
    /// `Ok(None)` is a valid "nothing to report" result. Long-running
    /// detectors should poll [`AnalysisContext::is_canceled`] and return
    /// [`DetectorError::Canceled`] when it fires.
    fn analyze(
        &mut self,
        request: &AnalysisRequest,
        ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError>;
}

/// Input of one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub resource_id: String,
    pub resource_type: String,
    pub cadence_minutes: u32,
    /// Start of the analyzed window, as an RFC 3339 timestamp.
    #[serde(default)]
    pub window_start: Option<String>,
    /// End of the analyzed window, as an RFC 3339 timestamp.
    #[serde(default)]
    pub window_end: Option<String>,
    /// Opaque telemetry handed to the detector.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl AnalysisRequest {
    pub fn new(resource_id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            resource_type: resource_type.into(),
            cadence_minutes: 60,
            window_start: None,
            window_end: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Alerts raised by one analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Informational,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub resource_id: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Errors a detector can raise.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    /// The detector observed cancellation and stopped.
    #[error("analysis canceled")]
    Canceled,

    /// The detector failed with its own reason code.
    #[error("{code}: {message}")]
    Failed { code: String, message: String },

    /// A state repository call failed.
    #[error(transparent)]
    State(#[from] StateError),
}

impl DetectorError {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// Diagnostics sink handed to detectors.
pub trait Tracer: Send + Sync {
    fn trace(&self, level: TraceLevel, message: &str);
}

/// Tracer that forwards to `tracing`, tagged with the module id.
pub struct TracingTracer {
    module_id: String,
}

impl TracingTracer {
    pub fn new(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
        }
    }
}

impl Tracer for TracingTracer {
    fn trace(&self, level: TraceLevel, message: &str) {
        let module = self.module_id.as_str();
        match level {
            TraceLevel::Debug => tracing::debug!(module = %module, "{}", message),
            TraceLevel::Info => tracing::info!(module = %module, "{}", message),
            TraceLevel::Warning => tracing::warn!(module = %module, "{}", message),
            TraceLevel::Error => tracing::error!(module = %module, "{}", message),
        }
    }
}

/// Everything a detector can reach during one run.
pub struct AnalysisContext<'a> {
    tracer: &'a dyn Tracer,
    cancellation: &'a CancellationToken,
    state: &'a StateRepository,
}

impl<'a> AnalysisContext<'a> {
    pub fn new(
        tracer: &'a dyn Tracer,
        cancellation: &'a CancellationToken,
        state: &'a StateRepository,
    ) -> Self {
        Self {
            tracer,
            cancellation,
            state,
        }
    }

    pub fn tracer(&self) -> &dyn Tracer {
        self.tracer
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.cancellation
    }

    /// Whether the run has been asked to stop.
    pub fn is_canceled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// State repository scoped to this module and run scope.
    pub fn state(&self) -> &StateRepository {
        self.state
    }

    pub fn info(&self, message: &str) {
        self.tracer.trace(TraceLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.tracer.trace(TraceLevel::Warning, message);
    }
}
