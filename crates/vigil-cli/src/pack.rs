//! Pack command implementation for Vigil CLI.

use std::path::{Path, PathBuf};

use vigil_core::{ModulePackage, VigilDirs};

use crate::colors;

/// `<packages_dir>/<id>-<version>.tar.gz` for the package in `dir`.
pub fn default_output(dirs: &VigilDirs, dir: &Path) -> anyhow::Result<PathBuf> {
    let package = ModulePackage::open(dir).map_err(vigil_core::Error::from)?;
    let manifest = package.manifest();
    Ok(dirs
        .packages_dir
        .join(format!("{}-{}.tar.gz", manifest.id, manifest.version)))
}

/// Validate the package in `dir` and write it as an archive.
pub fn execute(dir: &Path, output: &Path) -> anyhow::Result<()> {
    let package = ModulePackage::open(dir).map_err(vigil_core::Error::from)?;
    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    package
        .write_archive(output)
        .map_err(vigil_core::Error::from)?;

    println!(
        "{}Packed{} {} ({} files) into {}",
        colors::GREEN,
        colors::RESET,
        package.manifest().id,
        package.content().len(),
        output.display()
    );
    Ok(())
}
