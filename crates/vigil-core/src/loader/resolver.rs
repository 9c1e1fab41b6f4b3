//! Turning a code-unit file into a [`CodeUnit`].

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use libloading::{Library, Symbol};

use super::registry::{ABI_VERSION, CodeUnit};

/// A code unit together with whatever keeps its code mapped.
pub struct OpenedUnit {
    pub unit: CodeUnit,
    pub(crate) library: Option<Library>,
}

impl OpenedUnit {
    /// A unit compiled into the current binary.
    pub fn builtin(unit: CodeUnit) -> Self {
        Self {
            unit,
            library: None,
        }
    }
}

/// One way of opening code-unit files.
///
/// Resolvers are tried in order; the first one that recognizes a file
/// decides the outcome.
pub trait CodeUnitResolver: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Open `path`. `Ok(None)` means the file is not in this resolver's format.
    fn open(&self, path: &Path) -> Result<Option<OpenedUnit>, String>;
}

/// First bytes of a registration shim naming a compiled-in code unit.
pub const BUILTIN_SHIM_PREFIX: &str = "#!vigil-builtin ";

/// Resolves registration shims to code units compiled into the host binary.
#[derive(Default)]
pub struct BuiltinResolver {
    units: HashMap<String, fn() -> CodeUnit>,
}

impl BuiltinResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `build` available under `unit_name`.
    pub fn register(mut self, unit_name: impl Into<String>, build: fn() -> CodeUnit) -> Self {
        self.units.insert(unit_name.into(), build);
        self
    }

    pub fn contains(&self, unit_name: &str) -> bool {
        self.units.contains_key(unit_name)
    }

    /// Contents of a shim file pointing at `unit_name`.
    pub fn shim(unit_name: &str) -> Vec<u8> {
        format!("{}{}\n", BUILTIN_SHIM_PREFIX, unit_name).into_bytes()
    }
}

impl CodeUnitResolver for BuiltinResolver {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn open(&self, path: &Path) -> Result<Option<OpenedUnit>, String> {
        let bytes = std::fs::read(path).map_err(|e| format!("failed to read code unit: {}", e))?;
        let Some(rest) = bytes.strip_prefix(BUILTIN_SHIM_PREFIX.as_bytes()) else {
            return Ok(None);
        };
        let unit_name = std::str::from_utf8(rest)
            .map_err(|_| "builtin shim is not valid UTF-8".to_string())?
            .trim();

        let build = self
            .units
            .get(unit_name)
            .ok_or_else(|| format!("builtin code unit '{}' is not registered", unit_name))?;
        Ok(Some(OpenedUnit::builtin(build())))
    }
}

const ABI_SYMBOL: &[u8] = b"vigil_abi_version";
const UNIT_SYMBOL: &[u8] = b"vigil_code_unit";

/// Resolves dynamic libraries built with [`export_code_unit!`](crate::export_code_unit).
#[derive(Default)]
pub struct DylibResolver;

impl CodeUnitResolver for DylibResolver {
    fn name(&self) -> &'static str {
        "dylib"
    }

    fn open(&self, path: &Path) -> Result<Option<OpenedUnit>, String> {
        let mut magic = [0u8; 4];
        let read = File::open(path)
            .and_then(|mut file| file.read(&mut magic))
            .map_err(|e| format!("failed to read code unit: {}", e))?;
        if !is_shared_library(&magic[..read]) {
            return Ok(None);
        }

        // SAFETY: loading runs the library's initializers. Packages are
        // only ever loaded inside a disposable worker process.
        let library = unsafe { Library::new(path) }
            .map_err(|e| format!("failed to load library: {}", e))?;

        let abi = unsafe {
            let version: Symbol<fn() -> u32> = library
                .get(ABI_SYMBOL)
                .map_err(|e| format!("library does not export vigil_abi_version: {}", e))?;
            version()
        };
        if abi != ABI_VERSION {
            return Err(format!(
                "library was built for ABI version {}, expected {}",
                abi, ABI_VERSION
            ));
        }

        let unit = unsafe {
            let entry: Symbol<fn() -> CodeUnit> = library
                .get(UNIT_SYMBOL)
                .map_err(|e| format!("library does not export vigil_code_unit: {}", e))?;
            std::panic::catch_unwind(|| entry())
                .map_err(|_| "vigil_code_unit panicked".to_string())?
        };

        Ok(Some(OpenedUnit {
            unit,
            library: Some(library),
        }))
    }
}

/// Whether `magic` starts an ELF, PE or Mach-O image.
fn is_shared_library(magic: &[u8]) -> bool {
    const ELF: &[u8] = b"\x7fELF";
    const MACH_O: [[u8; 4]; 5] = [
        [0xfe, 0xed, 0xfa, 0xce],
        [0xfe, 0xed, 0xfa, 0xcf],
        [0xce, 0xfa, 0xed, 0xfe],
        [0xcf, 0xfa, 0xed, 0xfe],
        [0xca, 0xfe, 0xba, 0xbe],
    ];
    magic.starts_with(ELF)
        || magic.starts_with(b"MZ")
        || MACH_O.iter().any(|m| magic.starts_with(m))
}
