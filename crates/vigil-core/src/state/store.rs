//! Blob stores backing the state repository.
//!
//! The repository needs only three primitives from its storage, so both a
//! local directory and a cloud container can sit behind [`BlobStore`].

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

/// Minimal storage contract consumed by the state repository.
///
/// Names are `/`-separated and contain only URL-safe characters.
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under `name`, replacing any previous blob atomically.
    fn put(&self, name: &str, bytes: &[u8]) -> io::Result<()>;

    /// Fetch a blob, `None` if it does not exist.
    fn get(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// Remove a blob. Removing a missing blob succeeds.
    fn delete_if_exists(&self, name: &str) -> io::Result<()>;
}

/// Attempts made to observe a file's removal before giving up.
const DELETE_POLL_ATTEMPTS: u32 = 50;
const DELETE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Blob store over a local directory.
///
/// Writes go to a temporary sibling first and are renamed into place, so a
/// reader never observes a partially written blob and a crash mid-write
/// leaves the previous value intact.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

impl BlobStore for FileBlobStore {
    fn put(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.blob_path(name);
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::other(format!("blob '{}' has no parent", name)))?;
        fs::create_dir_all(parent)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            io::Write::write_all(&mut file, bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &path)
        };
        let result = write();
        if result.is_err() {
            let _ = fs::remove_file(&temp);
        }
        result
    }

    fn get(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete_if_exists(&self, name: &str) -> io::Result<()> {
        let path = self.blob_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        }

        // Some platforms report success before the entry is really gone.
        for _ in 0..DELETE_POLL_ATTEMPTS {
            if !path.exists() {
                return Ok(());
            }
            thread::sleep(DELETE_POLL_INTERVAL);
        }
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("blob '{}' still present after delete", name),
        ))
    }
}

/// In-memory blob store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.blobs.write().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(name).cloned())
    }

    fn delete_if_exists(&self, name: &str) -> io::Result<()> {
        self.blobs.write().remove(name);
        Ok(())
    }
}
