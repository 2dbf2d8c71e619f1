//! Chunk model: the unit of transfer, and the on-disk naming scheme.
//!
//! A chunk file is named `{file_id}_{index}.chunk`. Grouping by file and
//! ordering by index is a pure string operation on that name, so the
//! assembler never needs anything but a directory listing.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto;

/// Extension of persisted chunk files.
pub const CHUNK_EXTENSION: &str = "chunk";

/// Suffix of the per-file manifest written next to the chunk files.
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Longest file id the receiver will accept.
pub const MAX_FILE_ID_LEN: usize = 128;

/// A bounded-size, checksummed slice of a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Opaque identifier of one split operation.
    pub file_id: String,
    /// Zero-based position within the file.
    pub index: u32,
    /// Total chunk count for `file_id`.
    pub total: u32,
    /// Raw bytes. Only the last chunk may be shorter than the chunk size.
    pub payload: Bytes,
    /// Hex SHA-256 of `payload`, computed at split time.
    pub checksum: String,
    /// Base name of the original file.
    pub source_file_name: String,
}

impl Chunk {
    /// Build a chunk and compute its checksum from the payload.
    pub fn new(
        file_id: impl Into<String>,
        index: u32,
        total: u32,
        payload: Bytes,
        source_file_name: impl Into<String>,
    ) -> Self {
        let checksum = crypto::checksum(&payload);
        Self {
            file_id: file_id.into(),
            index,
            total,
            payload,
            checksum,
            source_file_name: source_file_name.into(),
        }
    }

    /// Recompute the payload hash and compare with the claimed checksum.
    pub fn checksum_matches(&self) -> bool {
        crypto::verify_checksum(&self.payload, &self.checksum)
    }

    /// Persisted file name for this chunk.
    pub fn file_name(&self) -> String {
        chunk_file_name(&self.file_id, self.index)
    }
}

/// Per-file sidecar written by the receiver so reassembly can check that
/// no trailing chunks are missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferManifest {
    pub file_id: String,
    pub total_chunks: u32,
    pub file_name: String,
}

// ── Naming ────────────────────────────────────────────────────────────────────

/// `{file_id}_{index}.chunk`
pub fn chunk_file_name(file_id: &str, index: u32) -> String {
    format!("{file_id}_{index}.{CHUNK_EXTENSION}")
}

/// `{file_id}.manifest.json`
pub fn manifest_file_name(file_id: &str) -> String {
    format!("{file_id}{MANIFEST_SUFFIX}")
}

/// Parse a chunk file name back into `(file_id, index)`.
///
/// Returns `None` for anything that is not a chunk file, so callers can
/// scan a directory and skip unrelated entries.
pub fn parse_chunk_file_name(name: &str) -> Option<(String, u32)> {
    let stem = name.strip_suffix(CHUNK_EXTENSION)?.strip_suffix('.')?;
    let (file_id, index) = stem.rsplit_once('_')?;
    if validate_file_id(file_id).is_err() {
        return None;
    }
    // Reject "+1", "01" and friends so the name round-trips exactly.
    if index.is_empty() || (index.len() > 1 && index.starts_with('0')) {
        return None;
    }
    if !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = index.parse().ok()?;
    Some((file_id.to_string(), index))
}

/// Check that a file id is safe to use as a path component.
pub fn validate_file_id(file_id: &str) -> Result<(), ChunkNameError> {
    if file_id.is_empty() {
        return Err(ChunkNameError::EmptyFileId);
    }
    if file_id.len() > MAX_FILE_ID_LEN {
        return Err(ChunkNameError::FileIdTooLong(file_id.len()));
    }
    if let Some(c) = file_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-'))
    {
        return Err(ChunkNameError::InvalidCharacter(c));
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkNameError {
    #[error("file id is empty")]
    EmptyFileId,

    #[error("file id is {0} bytes, maximum is {MAX_FILE_ID_LEN}")]
    FileIdTooLong(usize),

    #[error("file id contains invalid character {0:?}")]
    InvalidCharacter(char),
}
