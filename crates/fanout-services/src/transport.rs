//! Sender-side RPC transport.
//!
//! `ChunkTransport` is the seam between the dispatch engine and the network;
//! tests swap in scripted transports, `TcpTransport` speaks the wire format.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use fanout_core::chunk::Chunk;
use fanout_core::wire::{Request, Response, WireError};

use crate::rpc::frame::{read_frame, write_frame, FrameError};
use crate::service::Ack;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {node} failed: {source}")]
    Connect {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("call to {node} timed out after {after:?}")]
    Timeout { node: String, after: Duration },

    #[error("i/o error talking to {node}: {source}")]
    Io {
        node: String,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error from {node}: {message}")]
    Protocol { node: String, message: String },

    #[error("{node} reported error: {message}")]
    Remote { node: String, message: String },
}

impl TransportError {
    /// True for failures of the network path itself (connect, I/O, deadline).
    /// False for a peer that answered but not usefully.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. } | TransportError::Timeout { .. } | TransportError::Io { .. }
        )
    }

    fn from_frame(node: &str, e: FrameError) -> Self {
        match e {
            FrameError::Io(source) => TransportError::Io {
                node: node.to_string(),
                source,
            },
            FrameError::Wire(w) => Self::protocol(node, w),
        }
    }

    fn protocol(node: &str, e: WireError) -> Self {
        TransportError::Protocol {
            node: node.to_string(),
            message: e.to_string(),
        }
    }
}

/// Delivers chunks to receiver nodes addressed as `host:port`.
#[async_trait]
pub trait ChunkTransport: Send + Sync + 'static {
    async fn send_chunk(&self, node: &str, chunk: &Chunk) -> Result<Ack, TransportError>;

    async fn health_check(&self, node: &str) -> Result<bool, TransportError>;
}

/// One TCP connection per call, bounded by a deadline covering connect,
/// request and response.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn call(&self, node: &str, request: Request) -> Result<Response, TransportError> {
        match tokio::time::timeout(self.timeout, call_once(node, request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                node: node.to_string(),
                after: self.timeout,
            }),
        }
    }
}

async fn call_once(node: &str, request: Request) -> Result<Response, TransportError> {
    let frame = request
        .encode()
        .map_err(|e| TransportError::protocol(node, e))?;

    let mut stream = TcpStream::connect(node)
        .await
        .map_err(|source| TransportError::Connect {
            node: node.to_string(),
            source,
        })?;
    let _ = stream.set_nodelay(true);

    write_frame(&mut stream, &frame)
        .await
        .map_err(|e| TransportError::from_frame(node, e))?;

    let raw = read_frame(&mut stream)
        .await
        .map_err(|e| TransportError::from_frame(node, e))?
        .ok_or_else(|| TransportError::Io {
            node: node.to_string(),
            source: std::io::ErrorKind::UnexpectedEof.into(),
        })?;

    Response::decode(raw.kind, &raw.meta).map_err(|e| TransportError::protocol(node, e))
}

#[async_trait]
impl ChunkTransport for TcpTransport {
    async fn send_chunk(&self, node: &str, chunk: &Chunk) -> Result<Ack, TransportError> {
        match self.call(node, Request::SendChunk(chunk.clone())).await? {
            Response::Ack(m) => Ok(Ack {
                success: m.success,
                message: m.message,
            }),
            Response::Error(m) => Err(TransportError::Remote {
                node: node.to_string(),
                message: m.message,
            }),
            Response::Health(_) => Err(TransportError::Protocol {
                node: node.to_string(),
                message: "health response to send_chunk".into(),
            }),
        }
    }

    async fn health_check(&self, node: &str) -> Result<bool, TransportError> {
        match self.call(node, Request::HealthCheck).await? {
            Response::Health(m) => Ok(m.ready),
            Response::Error(m) => Err(TransportError::Remote {
                node: node.to_string(),
                message: m.message,
            }),
            Response::Ack(_) => Err(TransportError::Protocol {
                node: node.to_string(),
                message: "ack response to health_check".into(),
            }),
        }
    }
}
