//! Reading and writing package directories and tar archives.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use super::{MANIFEST_FILE, ModuleManifest, ModulePackage, PackageError};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read a package laid out as a directory tree.
pub(super) fn read_dir(root: &Path) -> Result<ModulePackage, PackageError> {
    let mut files = BTreeMap::new();
    collect_dir(root, root, &mut files)?;
    into_package(files)
}

fn collect_dir(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, Vec<u8>>,
) -> Result<(), PackageError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_dir(root, &path, files)?;
        } else {
            let relative = path
                .strip_prefix(root)
                .map_err(|_| PackageError::InvalidEntryPath(path.display().to_string()))?;
            files.insert(entry_name(relative)?, fs::read(&path)?);
        }
    }
    Ok(())
}

/// Read a `.tar` or `.tar.gz` package archive.
pub(super) fn read_archive(path: &Path) -> Result<ModulePackage, PackageError> {
    let bytes = fs::read(path)?;
    let mut files = BTreeMap::new();
    let mut archive = tar::Archive::new(archive_reader(bytes));

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry_name(&entry.path()?)?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(name, data);
    }

    into_package(files)
}

/// Extract and parse just the manifest of an archive.
pub(super) fn read_archive_manifest(path: &Path) -> Option<ModuleManifest> {
    let bytes = fs::read(path).ok()?;
    let mut archive = tar::Archive::new(archive_reader(bytes));
    for entry in archive.entries().ok()? {
        let mut entry = entry.ok()?;
        let is_manifest = entry
            .path()
            .ok()
            .and_then(|p| entry_name(&p).ok())
            .is_some_and(|name| name == MANIFEST_FILE);
        if is_manifest {
            let mut data = Vec::new();
            entry.read_to_end(&mut data).ok()?;
            return ModuleManifest::from_json(&data).ok();
        }
    }
    None
}

/// Write a package as a gzipped tar archive.
pub(super) fn write_archive(package: &ModulePackage, path: &Path) -> Result<(), PackageError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let file = fs::File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let manifest = package.manifest().to_json();
    append(&mut builder, MANIFEST_FILE, &manifest)?;
    for (name, data) in package.content() {
        append(&mut builder, name, data)?;
    }

    builder.into_inner()?.finish()?;
    Ok(())
}

fn append<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), PackageError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data)?;
    Ok(())
}

fn archive_reader(bytes: Vec<u8>) -> Box<dyn Read> {
    if bytes.starts_with(&GZIP_MAGIC) {
        Box::new(GzDecoder::new(Cursor::new(bytes)))
    } else {
        Box::new(Cursor::new(bytes))
    }
}

/// Normalize an entry path to a relative `/`-separated name.
fn entry_name(path: &Path) -> Result<String, PackageError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(PackageError::InvalidEntryPath(path.display().to_string())),
        }
    }
    if parts.is_empty() {
        return Err(PackageError::InvalidEntryPath(path.display().to_string()));
    }
    Ok(parts.join("/"))
}

fn into_package(mut files: BTreeMap<String, Vec<u8>>) -> Result<ModulePackage, PackageError> {
    let manifest_bytes = files.remove(MANIFEST_FILE).ok_or(PackageError::MissingManifest)?;
    let manifest = ModuleManifest::from_json(&manifest_bytes)?;
    ModulePackage::new(manifest, files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::tests::manifest;
    use tempfile::TempDir;

    fn sample() -> ModulePackage {
        let content = BTreeMap::from([
            ("d1main".to_string(), b"#!vigil-builtin samples".to_vec()),
            ("lib/helper.bin".to_string(), vec![0, 1, 2, 3]),
        ]);
        ModulePackage::new(manifest("d1", "d1main", "D1.Detector"), content).unwrap()
    }

    #[test]
    fn test_archive_preserves_package() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/d1.tar.gz");
        let package = sample();

        package.write_archive(&path).unwrap();
        let reopened = ModulePackage::open(&path).unwrap();
        assert_eq!(reopened, package);

        let manifest = ModulePackage::peek_manifest(&path).unwrap();
        assert_eq!(&manifest, package.manifest());
    }

    #[test]
    fn test_open_directory() {
        let temp = TempDir::new().unwrap();
        let package = sample();
        fs::write(temp.path().join(MANIFEST_FILE), package.manifest().to_json()).unwrap();
        fs::write(temp.path().join("d1main"), b"#!vigil-builtin samples").unwrap();
        fs::create_dir_all(temp.path().join("lib")).unwrap();
        fs::write(temp.path().join("lib/helper.bin"), [0, 1, 2, 3]).unwrap();

        let opened = ModulePackage::open(temp.path()).unwrap();
        assert_eq!(opened, package);
    }

    #[test]
    fn test_directory_without_manifest() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("d1main"), b"x").unwrap();
        assert!(matches!(
            ModulePackage::open(temp.path()),
            Err(PackageError::MissingManifest)
        ));
    }

    #[test]
    fn test_garbage_archive_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broken.tar.gz");
        fs::write(&path, [0x1f, 0x8b, 0, 1, 2, 3]).unwrap();
        assert!(ModulePackage::open(&path).is_err());
        assert!(ModulePackage::peek_manifest(&path).is_none());
    }

    #[test]
    fn test_entry_names() {
        assert_eq!(entry_name(Path::new("./manifest.json")).unwrap(), "manifest.json");
        assert_eq!(entry_name(Path::new("lib/a.so")).unwrap(), "lib/a.so");
        assert!(entry_name(Path::new("../a")).is_err());
        assert!(entry_name(Path::new(".")).is_err());
    }
}
