//! Chunk receiver: validates incoming chunks and persists them.

use fanout_core::chunk::{validate_file_id, Chunk, TransferManifest};

use crate::chunk_store::ChunkStore;
use crate::received::ReceivedSet;
use crate::service::{Ack, TransferService};

pub const ACK_RECEIVED: &str = "chunk received";
pub const ACK_CHECKSUM_MISMATCH: &str = "checksum mismatch";

pub struct ChunkReceiver {
    received: ReceivedSet,
    store: ChunkStore,
}

impl ChunkReceiver {
    pub fn new(received: ReceivedSet, store: ChunkStore) -> Self {
        Self { received, store }
    }

    pub fn received(&self) -> &ReceivedSet {
        &self.received
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    fn validate(chunk: &Chunk) -> Result<(), String> {
        validate_file_id(&chunk.file_id).map_err(|e| e.to_string())?;
        if chunk.total == 0 {
            return Err("total_chunks must be at least 1".into());
        }
        if chunk.index >= chunk.total {
            return Err(format!(
                "index {} out of range for {} chunks",
                chunk.index, chunk.total
            ));
        }
        if chunk.payload.is_empty() {
            return Err("empty chunk payload".into());
        }
        Ok(())
    }
}

impl TransferService for ChunkReceiver {
    fn accept_chunk(&self, chunk: Chunk) -> Ack {
        if let Err(reason) = Self::validate(&chunk) {
            tracing::warn!(
                file_id = %chunk.file_id,
                index = chunk.index,
                total = chunk.total,
                reason = %reason,
                "chunk refused"
            );
            return Ack::rejected(reason);
        }

        if !chunk.checksum_matches() {
            tracing::warn!(
                file_id = %chunk.file_id,
                index = chunk.index,
                claimed = %chunk.checksum,
                "checksum mismatch"
            );
            return Ack::rejected(ACK_CHECKSUM_MISMATCH);
        }

        let recorded = match self.received.record(
            &chunk.file_id,
            chunk.index,
            chunk.total,
            &chunk.source_file_name,
        ) {
            Ok(r) => r,
            Err(conflict) => {
                tracing::warn!(
                    file_id = %chunk.file_id,
                    index = chunk.index,
                    error = %conflict,
                    "chunk refused"
                );
                return Ack::rejected(conflict.to_string());
            }
        };

        // Disk writes happen outside the received-set lock. The manifest is
        // ensured on every chunk: a receipt can outlive a failed first write.
        let manifest = TransferManifest {
            file_id: chunk.file_id.clone(),
            total_chunks: chunk.total,
            file_name: chunk.source_file_name.clone(),
        };
        if let Err(e) = self.store.ensure_manifest(&manifest) {
            tracing::error!(
                file_id = %chunk.file_id,
                index = chunk.index,
                error = %e,
                "failed to write manifest"
            );
            return Ack::rejected(format!("{e:#}"));
        }

        if let Err(e) = self.store.put(&chunk.file_id, chunk.index, &chunk.payload) {
            tracing::error!(
                file_id = %chunk.file_id,
                index = chunk.index,
                error = %e,
                "failed to persist chunk"
            );
            return Ack::rejected(format!("{e:#}"));
        }

        tracing::debug!(
            file_id = %chunk.file_id,
            index = chunk.index,
            total = chunk.total,
            bytes = chunk.payload.len(),
            duplicate = recorded.duplicate,
            received = recorded.received,
            "chunk stored"
        );
        if !recorded.duplicate && recorded.received == chunk.total as usize {
            tracing::info!(
                file_id = %chunk.file_id,
                file_name = %chunk.source_file_name,
                total = chunk.total,
                "all chunks received"
            );
        }

        Ack::ok(ACK_RECEIVED)
    }

    fn health_check(&self) -> bool {
        self.store.root().is_dir()
    }
}
