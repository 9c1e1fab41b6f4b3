//! Detector module packages.
//!
//! A package is a manifest plus a set of named files, one of which is the
//! main code unit. Packages are distributed as a directory or as a
//! (optionally gzipped) tar archive.

mod archive;
mod manifest;

use std::collections::BTreeMap;
use std::path::{Component, Path};

pub use manifest::{MANIFEST_FILE, ManifestError, ModuleManifest, ModuleVersion};

/// Errors from reading or assembling a package.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// Manifest is missing from the package.
    #[error("package has no {MANIFEST_FILE}")]
    MissingManifest,

    /// Manifest failed to parse or validate.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Package holds no code files.
    #[error("package content is empty")]
    Empty,

    /// No file matches the manifest's main code unit.
    #[error("package has no file for main code unit '{0}'")]
    MainUnitMissing(String),

    /// An entry escapes the package root.
    #[error("invalid package entry path '{0}'")]
    InvalidEntryPath(String),

    /// Archive or directory could not be read.
    #[error("failed to read package: {0}")]
    Io(#[from] std::io::Error),
}

/// An immutable detector package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulePackage {
    manifest: ModuleManifest,
    content: BTreeMap<String, Vec<u8>>,
}

impl ModulePackage {
    /// Assemble a package, checking the content invariants.
    pub fn new(
        manifest: ModuleManifest,
        content: BTreeMap<String, Vec<u8>>,
    ) -> Result<Self, PackageError> {
        manifest.validate()?;
        if content.is_empty() {
            return Err(PackageError::Empty);
        }
        for name in content.keys() {
            validate_entry_path(name)?;
        }
        let package = Self { manifest, content };
        if package.main_unit_entry().is_none() {
            return Err(PackageError::MainUnitMissing(
                package.manifest.main_code_unit_name.clone(),
            ));
        }
        Ok(package)
    }

    /// Open a package from a directory or an archive file.
    pub fn open(path: &Path) -> Result<Self, PackageError> {
        if path.is_dir() {
            archive::read_dir(path)
        } else {
            archive::read_archive(path)
        }
    }

    /// Read only the manifest of a package at `path`.
    ///
    /// Used for diagnostics when the full package fails to open.
    pub fn peek_manifest(path: &Path) -> Option<ModuleManifest> {
        if path.is_dir() {
            let bytes = std::fs::read(path.join(MANIFEST_FILE)).ok()?;
            ModuleManifest::from_json(&bytes).ok()
        } else {
            archive::read_archive_manifest(path)
        }
    }

    /// Write this package as a gzipped tar archive.
    pub fn write_archive(&self, path: &Path) -> Result<(), PackageError> {
        archive::write_archive(self, path)
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    /// Files of the package keyed by relative, `/`-separated path.
    pub fn content(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.content
    }

    /// The content entry holding the main code unit.
    ///
    /// Tries the bare name first, then the platform's dynamic library file
    /// names for it.
    pub fn main_unit_entry(&self) -> Option<&str> {
        code_unit_file_names(&self.manifest.main_code_unit_name)
            .into_iter()
            .find_map(|candidate| {
                self.content
                    .get_key_value(candidate.as_str())
                    .map(|(name, _)| name.as_str())
            })
    }
}

/// Candidate file names for a code unit, in resolution order.
pub fn code_unit_file_names(unit_name: &str) -> Vec<String> {
    use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};

    let mut names = vec![unit_name.to_string(), format!("{}{}", unit_name, DLL_SUFFIX)];
    if !DLL_PREFIX.is_empty() {
        names.push(format!("{}{}{}", DLL_PREFIX, unit_name, DLL_SUFFIX));
    }
    names
}

fn validate_entry_path(name: &str) -> Result<(), PackageError> {
    let path = Path::new(name);
    let only_normal = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if name.is_empty() || !only_normal {
        return Err(PackageError::InvalidEntryPath(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn manifest(id: &str, main_unit: &str, entry_type: &str) -> ModuleManifest {
        ModuleManifest {
            id: id.to_string(),
            name: format!("{} detector", id),
            description: String::new(),
            version: "1.0".parse().unwrap(),
            main_code_unit_name: main_unit.to_string(),
            entry_type_name: entry_type.to_string(),
            supported_resource_types: ["VirtualMachine".to_string()].into(),
            supported_cadences: [60].into(),
        }
    }

    #[test]
    fn test_main_unit_resolution_order() {
        let dylib = format!("d1main{}", std::env::consts::DLL_SUFFIX);
        let content = BTreeMap::from([
            (dylib.clone(), vec![1]),
            ("d1main".to_string(), vec![2]),
        ]);
        let package = ModulePackage::new(manifest("d1", "d1main", "D1.Detector"), content).unwrap();
        assert_eq!(package.main_unit_entry(), Some("d1main"));

        let content = BTreeMap::from([(dylib.clone(), vec![1])]);
        let package = ModulePackage::new(manifest("d1", "d1main", "D1.Detector"), content).unwrap();
        assert_eq!(package.main_unit_entry(), Some(dylib.as_str()));
    }

    #[test]
    fn test_rejects_missing_main_unit() {
        let content = BTreeMap::from([("helper".to_string(), vec![1])]);
        assert!(matches!(
            ModulePackage::new(manifest("d1", "d1main", "D1.Detector"), content),
            Err(PackageError::MainUnitMissing(name)) if name == "d1main"
        ));
    }

    #[test]
    fn test_rejects_empty_content() {
        assert!(matches!(
            ModulePackage::new(manifest("d1", "d1main", "D1.Detector"), BTreeMap::new()),
            Err(PackageError::Empty)
        ));
    }

    #[test]
    fn test_rejects_escaping_entries() {
        for bad in ["../d1main", "/etc/d1main", "a/../../b"] {
            let content = BTreeMap::from([
                ("d1main".to_string(), vec![1]),
                (bad.to_string(), vec![2]),
            ]);
            assert!(matches!(
                ModulePackage::new(manifest("d1", "d1main", "D1.Detector"), content),
                Err(PackageError::InvalidEntryPath(_))
            ));
        }
    }
}
