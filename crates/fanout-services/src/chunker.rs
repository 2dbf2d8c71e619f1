//! Chunker: deterministic split of a file into ordered, checksummed chunks.
//!
//! `FileChunker` streams: each call to `next()` reads exactly one chunk, so
//! a producer feeding a bounded queue only ever holds a queue's worth of
//! payload in memory. `split_file` collects the whole sequence.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use fanout_core::chunk::Chunk;
use fanout_core::crypto;

pub struct FileChunker {
    file: File,
    file_id: String,
    source_file_name: String,
    chunk_size: usize,
    file_size: u64,
    total: u32,
    next_index: u32,
    failed: bool,
}

impl FileChunker {
    /// Open `path` and prepare to split it into `chunk_size`-byte chunks.
    ///
    /// A fresh file id is generated on every call.
    pub fn open(path: &Path, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            bail!("chunk size must be positive");
        }
        let file =
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let file_size = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();

        let total = file_size.div_ceil(chunk_size as u64);
        let total = u32::try_from(total)
            .with_context(|| format!("{} needs {total} chunks, more than a u32", path.display()))?;

        let source_file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            file,
            file_id: crypto::new_file_id(path),
            source_file_name,
            chunk_size,
            file_size,
            total,
            next_index: 0,
            failed: false,
        })
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn source_file_name(&self) -> &str {
        &self.source_file_name
    }

    fn read_chunk(&mut self, index: u32) -> Result<Chunk> {
        let offset = index as u64 * self.chunk_size as u64;
        let len = (self.file_size - offset).min(self.chunk_size as u64) as usize;

        let mut buf = vec![0u8; len];
        self.file
            .read_exact(&mut buf)
            .with_context(|| format!("failed to read chunk {index} at offset {offset}"))?;

        if index + 1 == self.total {
            let mut probe = [0u8; 1];
            let extra = self.file.read(&mut probe).context("failed to probe end of file")?;
            if extra != 0 {
                bail!("file grew while it was being split");
            }
        }

        Ok(Chunk::new(
            self.file_id.clone(),
            index,
            self.total,
            Bytes::from(buf),
            self.source_file_name.clone(),
        ))
    }
}

impl Iterator for FileChunker {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next_index >= self.total {
            return None;
        }
        let index = self.next_index;
        self.next_index += 1;

        let result = self.read_chunk(index);
        if result.is_err() {
            // A read failure invalidates the whole split.
            self.failed = true;
        }
        Some(result)
    }
}

/// Split a file into its full ordered chunk list.
///
/// Fails as a whole on any I/O error; no partial list is returned.
pub fn split_file(path: &Path, chunk_size: usize) -> Result<Vec<Chunk>> {
    let chunker = FileChunker::open(path, chunk_size)?;
    let file_id = chunker.file_id().to_string();
    let total = chunker.total();
    let chunks = chunker.collect::<Result<Vec<_>>>()?;
    tracing::debug!(
        file = %path.display(),
        file_id = &file_id[..file_id.len().min(16)],
        total,
        "file split into chunks"
    );
    Ok(chunks)
}
