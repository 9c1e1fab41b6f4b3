//! Sample detectors compiled into the worker.
//!
//! Packages reach them through a registration shim naming
//! [`SAMPLES_UNIT`]. They cover the interesting behaviors of a module:
//! results, faults, crashes, cooperative and stubborn cancellation, and
//! entry types the loader must refuse.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use vigil_core::detector::{
    Alert, AnalysisContext, AnalysisRequest, AnalysisResult, Detector, DetectorError, Severity,
};
use vigil_core::loader::{BuiltinResolver, CodeUnit, TypeDescriptor};

/// Name of the built-in sample code unit.
pub const SAMPLES_UNIT: &str = "vigil-samples";

/// Resolver for every code unit compiled into the worker.
pub fn resolver() -> BuiltinResolver {
    BuiltinResolver::new().register(SAMPLES_UNIT, samples)
}

fn samples() -> CodeUnit {
    CodeUnit::new(SAMPLES_UNIT)
        .with_type(TypeDescriptor::detector::<Echo>("Vigil.Samples.Echo"))
        .with_type(TypeDescriptor::detector::<Silent>("Vigil.Samples.Silent"))
        .with_type(TypeDescriptor::detector::<Failing>("Vigil.Samples.Failing"))
        .with_type(TypeDescriptor::detector::<Panicking>("Vigil.Samples.Panicking"))
        .with_type(TypeDescriptor::detector::<Crash>("Vigil.Samples.Crash"))
        .with_type(TypeDescriptor::detector::<Cooperative>("Vigil.Samples.Cooperative"))
        .with_type(TypeDescriptor::detector::<Sleeper>("Vigil.Samples.Sleeper"))
        .with_type(TypeDescriptor::abstract_detector("Vigil.Samples.AbstractBase"))
        .with_type(TypeDescriptor::generic_detector("Vigil.Samples.Generic"))
        .with_type(TypeDescriptor::detector_without_default("Vigil.Samples.NeedsArgs"))
        .with_type(TypeDescriptor::plain("Vigil.Samples.Helper"))
        .with_type(TypeDescriptor::with_constructor(
            "Vigil.Samples.Exploding",
            refuse_construction,
        ))
}

fn refuse_construction() -> Result<Box<dyn Detector>, String> {
    Err("sample constructor refused to build".to_string())
}

fn payload_str<'a>(request: &'a AnalysisRequest, field: &str) -> Option<&'a str> {
    request.payload.get(field).and_then(|v| v.as_str())
}

/// Raises one alert and counts its runs in state.
#[derive(Default)]
struct Echo;

impl Detector for Echo {
    fn analyze(
        &mut self,
        request: &AnalysisRequest,
        ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        let cancel = ctx.cancellation();
        let runs = ctx.state().get_state::<u64>("runs", cancel)? + 1;
        ctx.state().store_state("runs", &runs, cancel)?;
        ctx.info(&format!("echo run {} for {}", runs, request.resource_id));

        let title = payload_str(request, "message").unwrap_or("echo");
        Ok(Some(AnalysisResult {
            alerts: vec![Alert {
                severity: Severity::Informational,
                title: title.to_string(),
                description: format!(
                    "{} seen at cadence {}",
                    request.resource_type, request.cadence_minutes
                ),
                resource_id: request.resource_id.clone(),
                properties: BTreeMap::from([("runs".to_string(), runs.to_string())]),
            }],
        }))
    }
}

/// Has nothing to report.
#[derive(Default)]
struct Silent;

impl Detector for Silent {
    fn analyze(
        &mut self,
        _request: &AnalysisRequest,
        _ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        Ok(None)
    }
}

#[derive(Default)]
struct Failing;

impl Detector for Failing {
    fn analyze(
        &mut self,
        request: &AnalysisRequest,
        _ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        let message = payload_str(request, "message").unwrap_or("sample detector failed");
        Err(DetectorError::failed("SampleFailure", message))
    }
}

#[derive(Default)]
struct Panicking;

impl Detector for Panicking {
    fn analyze(
        &mut self,
        _request: &AnalysisRequest,
        _ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        panic!("sample detector panicked")
    }
}

/// Takes the whole worker down without writing a result.
#[derive(Default)]
struct Crash;

impl Detector for Crash {
    fn analyze(
        &mut self,
        _request: &AnalysisRequest,
        _ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        std::process::abort()
    }
}

/// Works until it is canceled.
#[derive(Default)]
struct Cooperative;

impl Detector for Cooperative {
    fn analyze(
        &mut self,
        _request: &AnalysisRequest,
        ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        while !ctx.is_canceled() {
            thread::sleep(Duration::from_millis(20));
        }
        ctx.info("stopping on cancellation");
        Err(DetectorError::Canceled)
    }
}

/// Sleeps for `sleep_secs` (default 100) and never checks for cancellation.
#[derive(Default)]
struct Sleeper;

impl Detector for Sleeper {
    fn analyze(
        &mut self,
        request: &AnalysisRequest,
        _ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        let secs = request
            .payload
            .get("sleep_secs")
            .and_then(|v| v.as_u64())
            .unwrap_or(100);
        thread::sleep(Duration::from_secs(secs));
        Ok(None)
    }
}
