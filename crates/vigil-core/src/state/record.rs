//! On-store format of a state value.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use super::repository::DEFAULT_MAX_PAYLOAD_BYTES;

/// Largest encoded record, sized for a full payload plus gzip overhead and
/// the owner fields. Length prefixes past this are rejected before any
/// allocation happens.
pub(crate) const MAX_RECORD_BYTES: usize =
    DEFAULT_MAX_PAYLOAD_BYTES + DEFAULT_MAX_PAYLOAD_BYTES / 16;

/// A compressed state value wrapped with its owner's identity.
///
/// The identity is checked on every read; a record that does not match the
/// reader is treated as corrupt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StateRecord {
    pub owner_module_id: String,
    pub owner_run_scope_id: String,
    pub key: String,
    pub compressed_payload: Vec<u8>,
}

impl StateRecord {
    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let config = bincode::config::standard().with_limit::<MAX_RECORD_BYTES>();
        let (record, read) = bincode::serde::decode_from_slice::<Self, _>(bytes, config)
            .map_err(|e| e.to_string())?;
        if read != bytes.len() {
            return Err(format!("{} trailing bytes after record", bytes.len() - read));
        }
        Ok(record)
    }

    pub fn is_owned_by(&self, module_id: &str, run_scope_id: &str, key: &str) -> bool {
        self.owner_module_id == module_id
            && self.owner_run_scope_id == run_scope_id
            && self.key == key
    }
}

pub(crate) fn compress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::fast());
    encoder.write_all(payload)?;
    encoder.finish()
}

pub(crate) fn decompress(compressed: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut payload = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut payload)?;
    Ok(payload)
}
