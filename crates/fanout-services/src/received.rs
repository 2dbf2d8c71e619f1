//! Received set: which (file, index) pairs this receiver has accepted.
//!
//! One instance per receiver process, injected at construction. Entries are
//! never evicted, so the set grows with every distinct file received over
//! the process lifetime.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

#[derive(Debug, Clone, Default)]
struct FileReceipt {
    total: u32,
    file_name: String,
    indices: BTreeSet<u32>,
}

/// Outcome of recording one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Recorded {
    /// This was the first chunk seen for its file.
    pub first_for_file: bool,
    /// This index had already been recorded.
    pub duplicate: bool,
    /// Distinct indices now recorded for the file.
    pub received: usize,
}

/// A chunk disagreed with what is already known about its file.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("total chunk count {claimed} conflicts with {recorded} already recorded")]
pub struct ReceiptConflict {
    pub recorded: u32,
    pub claimed: u32,
}

/// Shared map of `file_id → received indices`.
#[derive(Clone, Default)]
pub struct ReceivedSet {
    files: Arc<DashMap<String, FileReceipt>>,
}

impl ReceivedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(file_id, index)` as received.
    ///
    /// The map mutation is the whole critical section; it holds the shard
    /// lock for one insert and never spans I/O.
    pub fn record(
        &self,
        file_id: &str,
        index: u32,
        total: u32,
        file_name: &str,
    ) -> Result<Recorded, ReceiptConflict> {
        match self.files.entry(file_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let receipt = entry.get_mut();
                if receipt.total != total {
                    return Err(ReceiptConflict {
                        recorded: receipt.total,
                        claimed: total,
                    });
                }
                let duplicate = !receipt.indices.insert(index);
                Ok(Recorded {
                    first_for_file: false,
                    duplicate,
                    received: receipt.indices.len(),
                })
            }
            Entry::Vacant(entry) => {
                let mut indices = BTreeSet::new();
                indices.insert(index);
                entry.insert(FileReceipt {
                    total,
                    file_name: file_name.to_string(),
                    indices,
                });
                Ok(Recorded {
                    first_for_file: true,
                    duplicate: false,
                    received: 1,
                })
            }
        }
    }

    pub fn contains(&self, file_id: &str, index: u32) -> bool {
        self.files
            .get(file_id)
            .map(|r| r.indices.contains(&index))
            .unwrap_or(false)
    }

    /// Distinct indices recorded for a file.
    pub fn received_count(&self, file_id: &str) -> usize {
        self.files.get(file_id).map(|r| r.indices.len()).unwrap_or(0)
    }

    /// True once every index `0..total` has been recorded.
    pub fn is_complete(&self, file_id: &str) -> bool {
        self.files
            .get(file_id)
            .map(|r| r.indices.len() == r.total as usize)
            .unwrap_or(false)
    }

    /// Indices in `0..total` not yet recorded for a file.
    pub fn missing(&self, file_id: &str) -> Vec<u32> {
        match self.files.get(file_id) {
            Some(r) => (0..r.total).filter(|i| !r.indices.contains(i)).collect(),
            None => Vec::new(),
        }
    }

    /// Number of distinct files seen.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Log a one-line summary per file, for the daemon's periodic stats.
    pub fn log_stats(&self) {
        if self.files.is_empty() {
            return;
        }
        let complete = self.files.iter().filter(|e| e.indices.len() == e.total as usize).count();
        tracing::info!(
            files = self.files.len(),
            complete,
            "received set stats"
        );
        for entry in self.files.iter() {
            let receipt = entry.value();
            tracing::debug!(
                file_id = &entry.key()[..entry.key().len().min(16)],
                file_name = %receipt.file_name,
                received = receipt.indices.len(),
                total = receipt.total,
                "  file"
            );
        }
    }
}
