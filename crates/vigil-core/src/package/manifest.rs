//! Module manifest parsing and validation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// File name of the manifest inside a package.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Errors found while parsing or validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    /// Manifest is not valid JSON or is missing fields.
    #[error("malformed manifest: {0}")]
    Malformed(String),

    /// A required text field is empty.
    #[error("manifest field '{0}' must not be empty")]
    EmptyField(&'static str),

    /// A required set is empty.
    #[error("manifest field '{0}' must contain at least one entry")]
    EmptySet(&'static str),

    /// A cadence of zero minutes was declared.
    #[error("supported cadences must be positive minute counts")]
    ZeroCadence,

    /// Version is not a dotted-integer string.
    #[error("invalid version '{0}': expected 1 to 4 dot-separated integers")]
    InvalidVersion(String),
}

/// Dotted-integer module version such as `1.2` or `1.0.3.7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleVersion(Vec<u32>);

impl ModuleVersion {
    pub fn components(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for ModuleVersion {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ManifestError::InvalidVersion(s.to_string());
        let parts = s
            .split('.')
            .map(|part| part.parse::<u32>().map_err(|_| invalid()))
            .collect::<Result<Vec<_>, _>>()?;
        if parts.is_empty() || parts.len() > 4 {
            return Err(invalid());
        }
        Ok(Self(parts))
    }
}

impl TryFrom<String> for ModuleVersion {
    type Error = ManifestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModuleVersion> for String {
    fn from(version: ModuleVersion) -> Self {
        version.to_string()
    }
}

impl fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for part in &self.0 {
            if !first {
                f.write_str(".")?;
            }
            write!(f, "{}", part)?;
            first = false;
        }
        Ok(())
    }
}

/// Descriptor of a detector module.
///
/// Immutable once parsed; equality is structural over every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: ModuleVersion,
    /// Name of the code unit holding the entry type, without extension.
    pub main_code_unit_name: String,
    /// Fully qualified name of the detector type inside the main code unit.
    pub entry_type_name: String,
    pub supported_resource_types: BTreeSet<String>,
    /// Run cadences in minutes.
    pub supported_cadences: BTreeSet<u32>,
}

impl ModuleManifest {
    /// Parse and validate a manifest from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Self =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Malformed(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize as pretty JSON.
    pub fn to_json(&self) -> Vec<u8> {
        // A manifest only holds strings, integers and sets of them.
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }

    /// Check the invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("mainCodeUnitName", &self.main_code_unit_name),
            ("entryTypeName", &self.entry_type_name),
        ] {
            if value.trim().is_empty() {
                return Err(ManifestError::EmptyField(field));
            }
        }
        if self.supported_resource_types.is_empty() {
            return Err(ManifestError::EmptySet("supportedResourceTypes"));
        }
        if self.supported_cadences.is_empty() {
            return Err(ManifestError::EmptySet("supportedCadences"));
        }
        if self.supported_cadences.contains(&0) {
            return Err(ManifestError::ZeroCadence);
        }
        Ok(())
    }

    /// Whether this module can analyze the given resource type.
    pub fn supports_resource_type(&self, resource_type: &str) -> bool {
        self.supported_resource_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(resource_type))
    }

    /// Whether this module can run at the given cadence.
    pub fn supports_cadence(&self, minutes: u32) -> bool {
        self.supported_cadences.contains(&minutes)
    }
}
