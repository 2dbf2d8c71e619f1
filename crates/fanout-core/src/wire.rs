//! fanout wire format: the RPC framing between sender and receiver.
//!
//! Every request and response is one frame:
//!
//!   [FrameHeader: 20 bytes][metadata: meta_len bytes JSON][payload: payload_len bytes]
//!
//! The header is fixed-size and little-endian on the wire. Metadata carries
//! the small typed fields of each RPC; the payload carries raw chunk bytes
//! so a 4 MiB chunk is never re-encoded.
//!
//! Changing anything in `FrameHeader` is a breaking protocol change; bump
//! `PROTOCOL_VERSION` if you do.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U32, U64};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::chunk::Chunk;

// ── Constants ─────────────────────────────────────────────────────────────────

/// First four bytes of every frame.
pub const MAGIC: [u8; 4] = *b"FNOT";

/// Current frame format version.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of `FrameHeader` on the wire.
pub const HEADER_LEN: usize = 20;

/// Largest metadata section accepted.
pub const MAX_META_LEN: usize = 64 * 1024;

/// Largest payload accepted. Chunks larger than this must be split smaller.
pub const MAX_PAYLOAD_LEN: u64 = 256 * 1024 * 1024;

/// Fixed per-chunk allowance the sender subtracts from the configured chunk
/// size for framing and metadata.
pub const PROTOCOL_OVERHEAD: usize = 500;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Fixed prefix of every frame.
///
/// Wire size: 20 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct FrameHeader {
    /// Always `MAGIC`. Anything else is not a fanout peer.
    pub magic: [u8; 4],

    /// Frame format version. Currently 0x01.
    pub version: u8,

    /// `FrameKind` discriminant.
    pub kind: u8,

    /// Reserved, must be zero.
    pub reserved: [u8; 2],

    /// Length of the JSON metadata section.
    pub meta_len: U32<LittleEndian>,

    /// Length of the raw payload section.
    pub payload_len: U64<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; HEADER_LEN]);

impl FrameHeader {
    pub fn new(kind: FrameKind, meta_len: usize, payload_len: u64) -> Result<Self, WireError> {
        if meta_len > MAX_META_LEN {
            return Err(WireError::MetaTooLarge(meta_len));
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(payload_len));
        }
        Ok(Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            kind: kind.into(),
            reserved: [0; 2],
            meta_len: U32::new(meta_len as u32),
            payload_len: U64::new(payload_len),
        })
    }

    /// Parse and validate a header read off the wire.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = FrameHeader::read_from(bytes).ok_or(WireError::Truncated(bytes.len()))?;
        if header.magic != MAGIC {
            return Err(WireError::BadMagic(header.magic));
        }
        if header.version != PROTOCOL_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.reserved != [0; 2] {
            return Err(WireError::ReservedBytesSet);
        }
        FrameKind::try_from(header.kind)?;
        if header.meta_len() > MAX_META_LEN {
            return Err(WireError::MetaTooLarge(header.meta_len()));
        }
        if header.payload_len() > MAX_PAYLOAD_LEN {
            return Err(WireError::PayloadTooLarge(header.payload_len()));
        }
        Ok(header)
    }

    pub fn frame_kind(&self) -> Result<FrameKind, WireError> {
        FrameKind::try_from(self.kind)
    }

    pub fn meta_len(&self) -> usize {
        self.meta_len.get() as usize
    }

    pub fn payload_len(&self) -> u64 {
        self.payload_len.get()
    }
}

// ── Frame Kind ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Request: store one chunk.
    SendChunk = 0x01,
    /// Request: readiness probe.
    HealthCheck = 0x02,
    /// Response to SendChunk.
    Ack = 0x81,
    /// Response to HealthCheck.
    Health = 0x82,
    /// Response: the request could not be processed at all.
    Error = 0xFF,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0x01 => Ok(FrameKind::SendChunk),
            0x02 => Ok(FrameKind::HealthCheck),
            0x81 => Ok(FrameKind::Ack),
            0x82 => Ok(FrameKind::Health),
            0xFF => Ok(FrameKind::Error),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

/// `SendChunk` metadata. The chunk content travels in the payload section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub file_id: String,
    pub index: u32,
    pub total_chunks: u32,
    pub filename: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMeta {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMeta {
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMeta {
    pub message: String,
}

/// A frame split into its three wire sections, ready to write.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub header: FrameHeader,
    pub meta: Vec<u8>,
    pub payload: Bytes,
}

fn encode<T: Serialize>(kind: FrameKind, meta: &T, payload: Bytes) -> Result<EncodedFrame, WireError> {
    let meta = serde_json::to_vec(meta).map_err(|e| WireError::Meta(e.to_string()))?;
    let header = FrameHeader::new(kind, meta.len(), payload.len() as u64)?;
    Ok(EncodedFrame {
        header,
        meta,
        payload,
    })
}

fn decode_meta<'a, T: Deserialize<'a>>(meta: &'a [u8]) -> Result<T, WireError> {
    serde_json::from_slice(meta).map_err(|e| WireError::Meta(e.to_string()))
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    SendChunk(Chunk),
    HealthCheck,
}

impl Request {
    pub fn encode(&self) -> Result<EncodedFrame, WireError> {
        match self {
            Request::SendChunk(chunk) => encode(
                FrameKind::SendChunk,
                &ChunkMeta {
                    file_id: chunk.file_id.clone(),
                    index: chunk.index,
                    total_chunks: chunk.total,
                    filename: chunk.source_file_name.clone(),
                    checksum: chunk.checksum.clone(),
                },
                chunk.payload.clone(),
            ),
            Request::HealthCheck => encode(FrameKind::HealthCheck, &serde_json::json!({}), Bytes::new()),
        }
    }

    /// Rebuild a request from a received frame.
    ///
    /// The checksum is taken as claimed; verifying it is the receiver's job.
    pub fn decode(kind: FrameKind, meta: &[u8], payload: Bytes) -> Result<Self, WireError> {
        match kind {
            FrameKind::SendChunk => {
                let m: ChunkMeta = decode_meta(meta)?;
                Ok(Request::SendChunk(Chunk {
                    file_id: m.file_id,
                    index: m.index,
                    total: m.total_chunks,
                    payload,
                    checksum: m.checksum,
                    source_file_name: m.filename,
                }))
            }
            FrameKind::HealthCheck => Ok(Request::HealthCheck),
            other => Err(WireError::UnexpectedKind(other)),
        }
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack(AckMeta),
    Health(HealthMeta),
    Error(ErrorMeta),
}

impl Response {
    pub fn ack(success: bool, message: impl Into<String>) -> Self {
        Response::Ack(AckMeta {
            success,
            message: message.into(),
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error(ErrorMeta {
            message: message.into(),
        })
    }

    pub fn encode(&self) -> Result<EncodedFrame, WireError> {
        match self {
            Response::Ack(m) => encode(FrameKind::Ack, m, Bytes::new()),
            Response::Health(m) => encode(FrameKind::Health, m, Bytes::new()),
            Response::Error(m) => encode(FrameKind::Error, m, Bytes::new()),
        }
    }

    pub fn decode(kind: FrameKind, meta: &[u8]) -> Result<Self, WireError> {
        match kind {
            FrameKind::Ack => Ok(Response::Ack(decode_meta(meta)?)),
            FrameKind::Health => Ok(Response::Health(decode_meta(meta)?)),
            FrameKind::Error => Ok(Response::Error(decode_meta(meta)?)),
            other => Err(WireError::UnexpectedKind(other)),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame header truncated: {0} bytes")]
    Truncated(usize),

    #[error("bad magic: {0:02x?}")]
    BadMagic([u8; 4]),

    #[error("unknown protocol version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unexpected frame kind: {0:?}")]
    UnexpectedKind(FrameKind),

    #[error("reserved header bytes are non-zero")]
    ReservedBytesSet,

    #[error("metadata length {0} exceeds maximum {MAX_META_LEN}")]
    MetaTooLarge(usize),

    #[error("payload length {0} exceeds maximum {MAX_PAYLOAD_LEN}")]
    PayloadTooLarge(u64),

    #[error("malformed metadata: {0}")]
    Meta(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
