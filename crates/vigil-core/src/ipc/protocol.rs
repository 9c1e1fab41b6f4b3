//! IPC protocol between the executor and its worker processes.
//!
//! Uses length-prefixed rkyv envelopes over the worker's stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded [`Envelope`].
//! Envelope payloads are JSON.
//!
//! Parent → worker: one `Input`, then optionally one `Cancel`.
//! Worker → parent: any number of `Heartbeat`s, then exactly one `Output`
//! or `Error`.

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::detector::AnalysisRequest;
use crate::error::{Error, Result};

/// Largest frame accepted from either side (100 MiB).
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub enum EnvelopeKind {
    /// Serialized [`WorkerInput`], parent to worker.
    Input,
    /// Serialized `Option<AnalysisResult>`, worker to parent.
    Output,
    /// Serialized [`WorkerFault`], worker to parent.
    Error,
    /// Liveness signal, worker to parent. Empty payload.
    Heartbeat,
    /// Cooperative cancellation request, parent to worker. Empty payload.
    Cancel,
}

impl EnvelopeKind {
    /// Whether this envelope ends the worker's side of the conversation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeKind::Output | EnvelopeKind::Error)
    }
}

/// One message on the parent/worker channel.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
pub struct Envelope {
    pub correlation_id: String,
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// An envelope without payload.
    pub fn signal(correlation_id: &str, kind: EnvelopeKind) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            kind,
            payload: Vec::new(),
        }
    }

    /// An envelope carrying `value` as JSON.
    pub fn json<T: Serialize>(correlation_id: &str, kind: EnvelopeKind, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Error::Serialization(format!("Failed to encode payload: {}", e)))?;
        Ok(Self {
            correlation_id: correlation_id.to_string(),
            kind,
            payload,
        })
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::Serialization(format!("Failed to decode {:?} payload: {}", self.kind, e)))
    }
}

/// Everything the worker needs for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInput {
    /// Package directory or archive to load.
    pub package_path: PathBuf,
    pub request: AnalysisRequest,
    pub state: StateBinding,
    /// Root under which the worker creates its package working directory.
    pub work_root: PathBuf,
    /// Heartbeat period; zero disables heartbeats.
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
}

/// Where the worker's state repository lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBinding {
    /// Root directory of the file-backed state store.
    pub root: PathBuf,
    pub run_scope_id: String,
}

/// Which part of the worker failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCategory {
    /// The package or entry type could not be loaded.
    Load,
    /// The module returned an error or panicked.
    Module,
    /// A state repository call failed inside the module.
    State,
    /// The module stopped because cancellation was requested.
    Canceled,
    /// The worker could not understand its input.
    Protocol,
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultCategory::Load => "load failure",
            FaultCategory::Module => "module error",
            FaultCategory::State => "state failure",
            FaultCategory::Canceled => "cancellation",
            FaultCategory::Protocol => "protocol error",
        };
        f.write_str(name)
    }
}

/// Longest fault message forwarded across the process boundary.
pub const MAX_FAULT_MESSAGE_CHARS: usize = 2048;

/// A failure reported by the worker.
///
/// Only a reason code and a bounded message cross the process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFault {
    pub category: FaultCategory,
    pub code: String,
    pub message: String,
}

impl WorkerFault {
    pub fn new(category: FaultCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: truncate_chars(message.into(), MAX_FAULT_MESSAGE_CHARS),
        }
    }

    /// Re-apply the message bound to a fault received from a worker.
    pub fn bounded(self) -> Self {
        Self::new(self.category, self.code, self.message)
    }
}

fn truncate_chars(mut message: String, max: usize) -> String {
    if let Some((index, _)) = message.char_indices().nth(max) {
        message.truncate(index);
        message.push('…');
    }
    message
}

fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(envelope)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", bytes.len())));
    }

    let mut frame = Vec::with_capacity(4 + bytes.len());
    frame.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(&bytes);
    Ok(frame)
}

fn frame_len(len_bytes: [u8; 4]) -> Result<usize> {
    let len = u32::from_le_bytes(len_bytes) as usize;
    // Sanity check: reject absurdly large messages
    if len > MAX_FRAME_BYTES {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }
    Ok(len)
}

fn decode_frame(body: &[u8]) -> Result<Envelope> {
    // The archive must be aligned before it can be validated.
    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(body.len());
    aligned.extend_from_slice(body);

    // Worker output is untrusted, so the archive is validated before use.
    rkyv::from_bytes::<Envelope, rkyv::rancor::Error>(&aligned)
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))
}

/// Write an envelope to a blocking writer.
pub fn write_envelope<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<()> {
    let frame = encode_frame(envelope)?;
    writer
        .write_all(&frame)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read an envelope from a blocking reader.
///
/// Returns `Ok(None)` when the stream ends cleanly between envelopes.
pub fn read_envelope<R: Read>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }
    let len = frame_len(len_bytes)?;

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;
    decode_frame(&body).map(Some)
}

/// Write an envelope to an async writer.
pub async fn write_envelope_async<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let frame = encode_frame(envelope)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;
    Ok(())
}

/// Read an envelope from an async reader.
///
/// Returns `Ok(None)` when the stream ends cleanly between envelopes.
pub async fn read_envelope_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Ipc(format!("Failed to read IPC message length: {}", e))),
    }
    let len = frame_len(len_bytes)?;

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;
    decode_frame(&body).map(Some)
}
