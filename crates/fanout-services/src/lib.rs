//! fanout-services: the transfer protocol's moving parts.
//!
//! Sender side: `chunker` splits a file, `dispatch` fans chunks out to
//! receiver nodes through a `ChunkTransport`.
//! Receiver side: `receiver` validates and persists chunks into a
//! `ChunkStore`, tracking receipts in a `ReceivedSet`; `rpc` exposes it over
//! TCP. `assembler` rebuilds files from a chunk directory after the fact.

pub mod assembler;
pub mod chunk_store;
pub mod chunker;
pub mod dispatch;
pub mod received;
pub mod receiver;
pub mod rpc;
pub mod service;
pub mod transport;

pub use assembler::{Assembler, AssemblyError, AssemblyReport, AssemblySummary};
pub use chunk_store::{ChunkEntry, ChunkStore};
pub use chunker::{split_file, FileChunker};
pub use dispatch::{
    CancelHandle, ChunkFailure, ChunkQueue, DispatchConfig, DispatchEngine, DispatchError,
    DispatchSummary, Progress,
};
pub use received::{ReceiptConflict, ReceivedSet, Recorded};
pub use receiver::ChunkReceiver;
pub use rpc::server::RpcServer;
pub use service::{Ack, TransferService};
pub use transport::{ChunkTransport, TcpTransport, TransportError};
