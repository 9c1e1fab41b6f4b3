//! Runtime directory management.
//!
//! Provides a consistent directory structure for Vigil so the CLI,
//! the executor and the worker agree on where things live.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Directory structure for a Vigil installation.
///
/// ```text
/// <base>/
/// └── .vigil/
///     ├── work/      # Per-load package working directories
///     ├── state/     # Persistent detector state
///     └── packages/  # Installed module packages
/// ```
#[derive(Debug, Clone)]
pub struct VigilDirs {
    /// The `.vigil` directory itself.
    pub vigil_dir: PathBuf,

    /// Root for per-load working directories.
    pub work_dir: PathBuf,

    /// Root of the file-backed state store.
    pub state_dir: PathBuf,

    /// Directory holding installed packages.
    pub packages_dir: PathBuf,
}

impl VigilDirs {
    /// Create the directory structure under `base_dir`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn from_base_dir(base_dir: &Path) -> Result<Self> {
        let vigil_dir = base_dir.join(".vigil");
        let work_dir = vigil_dir.join("work");
        let state_dir = vigil_dir.join("state");
        let packages_dir = vigil_dir.join("packages");

        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(&state_dir)?;
        fs::create_dir_all(&packages_dir)?;

        Ok(Self {
            vigil_dir,
            work_dir,
            state_dir,
            packages_dir,
        })
    }

    /// Remove leftover working directories.
    ///
    /// Working directories of crashed workers are never cleaned up by their
    /// owners, so this is the recovery path for them. State and installed
    /// packages are kept.
    pub fn clean_work(&self) -> Result<()> {
        if self.work_dir.exists() {
            fs::remove_dir_all(&self.work_dir)?;
        }
        fs::create_dir_all(&self.work_dir)?;
        Ok(())
    }
}

/// A working directory owned by exactly one module load.
///
/// Removed on [`cleanup`](ScopedWorkDir::cleanup) or when dropped.
#[derive(Debug)]
pub struct ScopedWorkDir {
    path: PathBuf,
    removed: bool,
}

impl ScopedWorkDir {
    /// Create a fresh, uniquely named directory under `root`.
    pub fn create(root: &Path, label: &str) -> io::Result<Self> {
        let safe_label: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = root.join(format!("{}-{}", safe_label, uuid::Uuid::new_v4().simple()));
        fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory now and report failures.
    pub fn cleanup(mut self) -> io::Result<()> {
        self.removed = true;
        remove_dir_if_exists(&self.path)
    }
}

impl Drop for ScopedWorkDir {
    fn drop(&mut self) {
        if !self.removed
            && let Err(e) = remove_dir_if_exists(&self.path)
        {
            tracing::warn!("Failed to remove working directory {}: {}", self.path.display(), e);
        }
    }
}

fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
