//! Serialization of the outbound queue for local persistence.
//!
//! The queue is stored as a single postcard document:
//! `[u8 format version][postcard Vec<QueueEntry>]`. The version byte lets a
//! future layout be detected instead of misread.

use crate::queue::QueueEntry;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u8 = 1;

/// Error type for snapshot encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The snapshot was written by an unknown format version.
    #[error("unsupported snapshot version {found} (expected {SNAPSHOT_VERSION})")]
    UnsupportedVersion {
        /// Version byte found in the snapshot.
        found: u8,
    },
    /// The snapshot has no version header.
    #[error("snapshot is empty")]
    Empty,
}

/// Encodes the queue contents, oldest first.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if an entry cannot be serialized.
pub fn encode_snapshot(entries: &[QueueEntry]) -> Result<Vec<u8>, CodecError> {
    let body =
        postcard::to_allocvec(entries).map_err(|e| CodecError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(SNAPSHOT_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a snapshot produced by [`encode_snapshot`].
///
/// # Errors
///
/// Returns `CodecError::Empty` for a zero-length input,
/// `CodecError::UnsupportedVersion` for an unknown header, or
/// `CodecError::Serialization` if the body is corrupt.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Vec<QueueEntry>, CodecError> {
    let (&version, body) = bytes.split_first().ok_or(CodecError::Empty)?;
    if version != SNAPSHOT_VERSION {
        return Err(CodecError::UnsupportedVersion { found: version });
    }
    postcard::from_bytes(body).map_err(|e| CodecError::Serialization(e.to_string()))
}
