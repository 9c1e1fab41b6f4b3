//! Loading detector packages.
//!
//! The loader materializes a package into a private working directory,
//! opens its main code unit through a chain of [`CodeUnitResolver`]s,
//! validates the manifest's entry type and constructs one detector
//! instance. Every failure maps to a [`LoadErrorReason`] that carries the
//! manifest identity.

mod registry;
mod resolver;

use std::any::Any;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use crate::detector::{AnalysisContext, AnalysisRequest, AnalysisResult, Detector, DetectorError};
use crate::error::{LoadError, LoadErrorReason};
use crate::package::{ModuleManifest, ModulePackage, PackageError, code_unit_file_names};
use crate::paths::ScopedWorkDir;

pub use registry::{ABI_VERSION, CodeUnit, Constructor, TypeDescriptor, TypeShape};
pub use resolver::{
    BUILTIN_SHIM_PREFIX, BuiltinResolver, CodeUnitResolver, DylibResolver, OpenedUnit,
};

/// A detector instance with everything it needs to stay valid.
///
/// Fields drop in declaration order: the instance goes before the library
/// that holds its code, and the working directory goes last.
pub struct LoadedModule {
    instance: Box<dyn Detector>,
    library: Option<Library>,
    manifest: ModuleManifest,
    work_dir: ScopedWorkDir,
}

impl LoadedModule {
    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// Directory the package was materialized into.
    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    /// Run the detector.
    pub fn analyze(
        &mut self,
        request: &AnalysisRequest,
        ctx: &AnalysisContext<'_>,
    ) -> Result<Option<AnalysisResult>, DetectorError> {
        self.instance.analyze(request, ctx)
    }

    /// Release the instance and library, then remove the working directory.
    pub fn cleanup(self) -> io::Result<()> {
        let LoadedModule {
            instance,
            library,
            work_dir,
            ..
        } = self;
        drop(instance);
        drop(library);
        work_dir.cleanup()
    }
}

impl std::fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModule")
            .field("manifest_id", &self.manifest.id)
            .field("dynamic", &self.library.is_some())
            .field("work_dir", &self.work_dir.path())
            .finish()
    }
}

/// Turns packages into live detector instances.
pub struct Loader {
    work_root: PathBuf,
    resolvers: Vec<Arc<dyn CodeUnitResolver>>,
}

impl Loader {
    /// A loader that materializes packages under `work_root`.
    ///
    /// No resolvers are installed; add them with [`with_resolver`](Self::with_resolver).
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            resolvers: Vec::new(),
        }
    }

    /// Append a resolver to the chain.
    pub fn with_resolver(mut self, resolver: impl CodeUnitResolver + 'static) -> Self {
        self.resolvers.push(Arc::new(resolver));
        self
    }

    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    /// Open the package at `path` and load it.
    pub fn load_path(&self, path: &Path) -> Result<LoadedModule, LoadError> {
        let package = ModulePackage::open(path).map_err(|e| {
            let reason = match e {
                PackageError::MainUnitMissing(_) => LoadErrorReason::MainUnitMissing,
                _ => LoadErrorReason::PackageCorrupt,
            };
            let (id, name) = ModulePackage::peek_manifest(path)
                .map(|m| (m.id, m.name))
                .unwrap_or_else(|| ("unknown".to_string(), path.display().to_string()));
            LoadError::new(reason, id, name, e.to_string())
        })?;
        self.load(&package)
    }

    /// Materialize `package` and construct its entry type.
    ///
    /// The package is not modified. Each call gets its own working
    /// directory, so the same package may be loaded any number of times.
    pub fn load(&self, package: &ModulePackage) -> Result<LoadedModule, LoadError> {
        let manifest = package.manifest();
        let fail = |reason: LoadErrorReason, message: String| {
            LoadError::new(reason, &manifest.id, &manifest.name, message)
        };

        let work_dir = ScopedWorkDir::create(&self.work_root, &manifest.id).map_err(|e| {
            fail(
                LoadErrorReason::PackageCorrupt,
                format!("failed to create working directory: {}", e),
            )
        })?;
        materialize(package, work_dir.path()).map_err(|e| {
            fail(
                LoadErrorReason::PackageCorrupt,
                format!("failed to materialize package: {}", e),
            )
        })?;

        let main_path = code_unit_file_names(&manifest.main_code_unit_name)
            .into_iter()
            .map(|name| work_dir.path().join(name))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                fail(
                    LoadErrorReason::MainUnitMissing,
                    format!(
                        "main code unit '{}' not found in package",
                        manifest.main_code_unit_name
                    ),
                )
            })?;

        let opened = self
            .open_unit(&main_path)
            .map_err(|message| fail(LoadErrorReason::PackageCorrupt, message))?;

        let descriptor = opened.unit.find(&manifest.entry_type_name).ok_or_else(|| {
            fail(
                LoadErrorReason::TypeMissing,
                format!(
                    "type '{}' not found in code unit '{}'",
                    manifest.entry_type_name,
                    opened.unit.name()
                ),
            )
        })?;
        let constructor = descriptor
            .validate()
            .map_err(|(reason, message)| fail(reason, message))?;

        let instance = match std::panic::catch_unwind(constructor) {
            Ok(Ok(instance)) => instance,
            Ok(Err(message)) => {
                return Err(fail(
                    LoadErrorReason::ConstructionFailed,
                    format!("constructor of '{}' failed: {}", descriptor.name(), message),
                ));
            }
            Err(panic) => {
                return Err(fail(
                    LoadErrorReason::ConstructionFailed,
                    format!(
                        "constructor of '{}' panicked: {}",
                        descriptor.name(),
                        panic_message(panic.as_ref())
                    ),
                ));
            }
        };

        tracing::debug!(
            module_id = %manifest.id,
            entry_type = %manifest.entry_type_name,
            work_dir = %work_dir.path().display(),
            "Loaded module"
        );

        Ok(LoadedModule {
            instance,
            library: opened.library,
            manifest: manifest.clone(),
            work_dir,
        })
    }

    fn open_unit(&self, path: &Path) -> Result<OpenedUnit, String> {
        for resolver in &self.resolvers {
            match resolver.open(path) {
                Ok(Some(unit)) => return Ok(unit),
                Ok(None) => continue,
                Err(message) => return Err(format!("{} resolver: {}", resolver.name(), message)),
            }
        }
        Err(format!(
            "code unit file '{}' is not in a recognized format",
            path.display()
        ))
    }
}

fn materialize(package: &ModulePackage, dir: &Path) -> io::Result<()> {
    for (name, bytes) in package.content() {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes)?;
    }
    Ok(())
}

/// Text of a panic payload.
pub fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::detector::{Alert, Severity, TracingTracer};
    use crate::package::tests::manifest;
    use crate::state::{MemoryBlobStore, StateRepository};

    #[derive(Default)]
    struct Counter;

    impl Detector for Counter {
        fn analyze(
            &mut self,
            request: &AnalysisRequest,
            ctx: &AnalysisContext<'_>,
        ) -> Result<Option<AnalysisResult>, DetectorError> {
            let cancel = ctx.cancellation();
            let runs: u64 = ctx.state().get_state("runs", cancel)?;
            ctx.state().store_state("runs", &(runs + 1), cancel)?;
            Ok(Some(AnalysisResult {
                alerts: vec![Alert {
                    severity: Severity::Informational,
                    title: format!("run {}", runs + 1),
                    description: String::new(),
                    resource_id: request.resource_id.clone(),
                    properties: BTreeMap::new(),
                }],
            }))
        }
    }

    fn failing_constructor() -> Result<Box<dyn Detector>, String> {
        Err("missing configuration".to_string())
    }

    fn panicking_constructor() -> Result<Box<dyn Detector>, String> {
        panic!("boom")
    }

    fn test_unit() -> CodeUnit {
        CodeUnit::new("tests")
            .with_type(TypeDescriptor::detector::<Counter>("T.Counter"))
            .with_type(TypeDescriptor::abstract_detector("T.Base"))
            .with_type(TypeDescriptor::generic_detector("T.Generic"))
            .with_type(TypeDescriptor::detector_without_default("T.NeedsArgs"))
            .with_type(TypeDescriptor::plain("T.Helper"))
            .with_type(TypeDescriptor::with_constructor("T.Failing", failing_constructor))
            .with_type(TypeDescriptor::with_constructor("T.Panicking", panicking_constructor))
    }

    fn loader(root: &Path) -> Loader {
        Loader::new(root)
            .with_resolver(BuiltinResolver::new().register("tests", test_unit))
            .with_resolver(DylibResolver)
    }

    fn package(entry_type: &str) -> ModulePackage {
        let content = BTreeMap::from([
            ("d1main".to_string(), BuiltinResolver::shim("tests")),
            ("data/readme.txt".to_string(), b"notes".to_vec()),
        ]);
        ModulePackage::new(manifest("d1", "d1main", entry_type), content).unwrap()
    }

    fn reason_for(entry_type: &str) -> LoadErrorReason {
        let temp = TempDir::new().unwrap();
        loader(temp.path()).load(&package(entry_type)).unwrap_err().reason
    }

    fn work_dirs(root: &Path) -> usize {
        fs::read_dir(root).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_load_and_analyze() {
        let temp = TempDir::new().unwrap();
        let package = package("T.Counter");
        let before = package.clone();

        let mut module = loader(temp.path()).load(&package).unwrap();
        assert_eq!(module.manifest().id, "d1");
        assert!(module.work_dir().join("data/readme.txt").is_file());

        let state = StateRepository::new(Arc::new(MemoryBlobStore::new()), "d1", "scope");
        let tracer = TracingTracer::new("d1");
        let cancel = CancellationToken::new();
        let ctx = AnalysisContext::new(&tracer, &cancel, &state);
        let request = AnalysisRequest::new("vm-1", "VirtualMachine");

        module.analyze(&request, &ctx).unwrap();
        let result = module.analyze(&request, &ctx).unwrap().unwrap();
        assert_eq!(result.alerts[0].title, "run 2");
        assert_eq!(package, before);
    }

    #[test]
    fn test_each_failure_has_its_own_reason() {
        assert_eq!(reason_for("T.Missing"), LoadErrorReason::TypeMissing);
        assert_eq!(reason_for("T.Helper"), LoadErrorReason::TypeNotCapability);
        assert_eq!(reason_for("T.Base"), LoadErrorReason::TypeAbstract);
        assert_eq!(reason_for("T.Generic"), LoadErrorReason::TypeGeneric);
        assert_eq!(
            reason_for("T.NeedsArgs"),
            LoadErrorReason::NoDefaultConstructor
        );
        assert_eq!(reason_for("T.Failing"), LoadErrorReason::ConstructionFailed);
        assert_eq!(
            reason_for("T.Panicking"),
            LoadErrorReason::ConstructionFailed
        );
    }

    #[test]
    fn test_error_carries_manifest_identity() {
        let temp = TempDir::new().unwrap();
        let err = loader(temp.path()).load(&package("T.Base")).unwrap_err();
        assert_eq!(err.manifest_id, "d1");
        assert_eq!(err.manifest_name, "d1 detector");
        assert!(err.message.contains("T.Base"));
    }

    #[test]
    fn test_unknown_unit_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let content = BTreeMap::from([("d1main".to_string(), BuiltinResolver::shim("nope"))]);
        let package =
            ModulePackage::new(manifest("d1", "d1main", "T.Counter"), content).unwrap();

        let err = loader(temp.path()).load(&package).unwrap_err();
        assert_eq!(err.reason, LoadErrorReason::PackageCorrupt);
    }

    #[test]
    fn test_unrecognized_unit_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let content = BTreeMap::from([("d1main".to_string(), b"plain text".to_vec())]);
        let package =
            ModulePackage::new(manifest("d1", "d1main", "T.Counter"), content).unwrap();

        let err = loader(temp.path()).load(&package).unwrap_err();
        assert_eq!(err.reason, LoadErrorReason::PackageCorrupt);
    }

    #[test]
    fn test_load_path_maps_package_errors() {
        let temp = TempDir::new().unwrap();
        let work = temp.path().join("work");
        let dir = temp.path().join("pkg");
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("manifest.json"),
            manifest("d1", "d1main", "T.Counter").to_json(),
        )
        .unwrap();
        fs::write(dir.join("other"), b"x").unwrap();

        let err = loader(&work).load_path(&dir).unwrap_err();
        assert_eq!(err.reason, LoadErrorReason::MainUnitMissing);
        assert_eq!(err.manifest_id, "d1");

        let err = loader(&work)
            .load_path(&temp.path().join("missing.tar.gz"))
            .unwrap_err();
        assert_eq!(err.reason, LoadErrorReason::PackageCorrupt);
        assert_eq!(err.manifest_id, "unknown");
    }

    #[test]
    fn test_load_path_from_archive() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("d1.tar.gz");
        package("T.Counter").write_archive(&archive).unwrap();

        let module = loader(&temp.path().join("work")).load_path(&archive).unwrap();
        assert_eq!(module.manifest().entry_type_name, "T.Counter");
    }

    #[test]
    fn test_loads_are_isolated_and_cleaned_up() {
        let temp = TempDir::new().unwrap();
        let loader = loader(temp.path());
        let package = package("T.Counter");

        let first = loader.load(&package).unwrap();
        let second = loader.load(&package).unwrap();
        assert_ne!(first.work_dir(), second.work_dir());
        assert_eq!(work_dirs(temp.path()), 2);

        first.cleanup().unwrap();
        drop(second);
        assert_eq!(work_dirs(temp.path()), 0);
    }

    #[test]
    fn test_failed_load_leaves_no_work_dir() {
        let temp = TempDir::new().unwrap();
        loader(temp.path()).load(&package("T.Base")).unwrap_err();
        assert_eq!(work_dirs(temp.path()), 0);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
