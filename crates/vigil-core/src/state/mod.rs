//! Detector state persistence.
//!
//! This module provides:
//! - The [`BlobStore`] contract and its file and in-memory implementations
//! - Compressed, owner-tagged state records
//! - The per-key locked [`StateRepository`]

mod locks;
mod record;
mod repository;
mod store;

pub use repository::{DEFAULT_MAX_PAYLOAD_BYTES, StateRepository};
pub use store::{BlobStore, FileBlobStore, MemoryBlobStore};
