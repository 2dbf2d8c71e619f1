//! Hashing primitives for fanout.
//!
//! Provides two things:
//!   1. SHA-256 checksums: per-chunk integrity and end-to-end file digests
//!   2. BLAKE3 file identifiers: one opaque ID per split invocation
//!
//! File IDs are NOT content addresses. Two splits of the same file produce
//! unrelated IDs because the path is mixed with wall-clock time and a random
//! nonce.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use sha2::{Digest, Sha256};

// ── SHA-256 ───────────────────────────────────────────────────────────────────

/// Hex-encoded SHA-256 of a byte slice.
///
/// This is the checksum carried in every chunk and recomputed by the
/// receiver before a chunk is accepted.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// True if `data` hashes to the claimed hex checksum.
///
/// Comparison is case-insensitive on the hex digits.
pub fn verify_checksum(data: &[u8], claimed: &str) -> bool {
    checksum(data).eq_ignore_ascii_case(claimed)
}

/// Incremental SHA-256 for data that arrives in pieces.
///
/// # Example
/// ```
/// use fanout_core::crypto::Checksummer;
/// let mut h = Checksummer::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// assert_eq!(h.finalize(), fanout_core::crypto::checksum(b"hello world"));
/// ```
#[derive(Default)]
pub struct Checksummer(Sha256);

impl Checksummer {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Consume the hasher and return the hex digest.
    pub fn finalize(self) -> String {
        hex::encode(self.0.finalize())
    }
}

// ── File IDs ──────────────────────────────────────────────────────────────────

/// Generate a fresh file identifier for one split of `path`.
///
///   file_id = hex(BLAKE3(abs_path || "-" || unix_nanos || nonce))
///
/// The result is 64 lowercase hex characters, which is always a valid
/// chunk-file name component.
pub fn new_file_id(path: &Path) -> String {
    let abs = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut hasher = blake3::Hasher::new();
    hasher.update(abs.to_string_lossy().as_bytes());
    hasher.update(b"-");
    hasher.update(nanos.to_string().as_bytes());
    hasher.update(&nonce);
    hasher.finalize().to_hex().to_string()
}
