//! Service trait for chunk-receiving services.
//!
//! The RPC server owns sockets and framing; a `TransferService` owns what a
//! chunk means once it arrives. Calls are synchronous and may block on disk
//! I/O, so the server runs them off the async executor.

use fanout_core::chunk::Chunk;
use fanout_core::wire::Response;

/// Reply to one `SendChunk` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

impl Ack {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl From<Ack> for Response {
    fn from(ack: Ack) -> Self {
        Response::ack(ack.success, ack.message)
    }
}

/// The receiver-side contract behind the RPC surface.
///
/// Intentionally minimal: one call per request kind.
pub trait TransferService: Send + Sync {
    /// Validate and persist one chunk.
    ///
    /// Never fails outright: every problem is reported in the ack so the
    /// sender can decide whether to retry.
    fn accept_chunk(&self, chunk: Chunk) -> Ack;

    /// True when the service is able to accept chunks.
    fn health_check(&self) -> bool;
}
