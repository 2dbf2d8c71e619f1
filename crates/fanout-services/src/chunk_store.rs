//! Chunk store: persisted chunk files for one receiver.
//!
//! Flat layout, one file per (file_id, index):
//!   {root}/{file_id}_{index}.chunk
//!   {root}/{file_id}.manifest.json
//!
//! Writes are atomic: write to a uniquely named temp file, then rename.
//! Two concurrent writers of the same chunk each rename their own temp file
//! and the last one wins; content is checksum-identical either way.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use memmap2::Mmap;

use fanout_core::chunk::{chunk_file_name, manifest_file_name, parse_chunk_file_name, TransferManifest};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One chunk file found by a directory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    pub file_id: String,
    pub index: u32,
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Create a store rooted at the given directory, creating it if absent.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create chunk dir: {}", root.display()))?;
        Ok(Self { root })
    }

    /// Open an existing directory without creating it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            bail!("chunk dir {} does not exist", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_path(&self, file_id: &str, index: u32) -> PathBuf {
        self.root.join(chunk_file_name(file_id, index))
    }

    pub fn manifest_path(&self, file_id: &str) -> PathBuf {
        self.root.join(manifest_file_name(file_id))
    }

    pub fn has(&self, file_id: &str, index: u32) -> bool {
        self.chunk_path(file_id, index).exists()
    }

    /// Persist a chunk payload. Overwrites any previous copy.
    pub fn put(&self, file_id: &str, index: u32, data: &[u8]) -> Result<PathBuf> {
        let path = self.chunk_path(file_id, index);
        self.write_atomic(&path, data)?;
        tracing::trace!(file_id, index, bytes = data.len(), "chunk persisted");
        Ok(path)
    }

    /// Read a chunk payload back.
    ///
    /// Returns None if not present. Non-empty files are read through mmap.
    pub fn get(&self, file_id: &str, index: u32) -> Result<Option<Bytes>> {
        let path = self.chunk_path(file_id, index);
        if !path.exists() {
            return Ok(None);
        }
        read_file(&path).map(Some)
    }

    /// Write the manifest for a file unless one is already present.
    pub fn ensure_manifest(&self, manifest: &TransferManifest) -> Result<()> {
        let path = self.manifest_path(&manifest.file_id);
        if path.is_file() {
            return Ok(());
        }
        let bytes = serde_json::to_vec_pretty(manifest).context("failed to encode manifest")?;
        self.write_atomic(&path, &bytes)
    }

    pub fn read_manifest(&self, file_id: &str) -> Result<Option<TransferManifest>> {
        let path = self.manifest_path(file_id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let manifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("malformed manifest {}", path.display()))?;
        Ok(Some(manifest))
    }

    /// Every chunk file in the directory. Other entries are skipped.
    pub fn entries(&self) -> Result<Vec<ChunkEntry>> {
        let dir = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?;
        let mut entries = Vec::new();
        for entry in dir {
            let entry = entry.with_context(|| format!("failed to list {}", self.root.display()))?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((file_id, index)) = parse_chunk_file_name(name) {
                entries.push(ChunkEntry {
                    file_id,
                    index,
                    path: entry.path(),
                });
            }
        }
        Ok(entries)
    }

    /// Count chunk files (for stats/debugging).
    pub fn count(&self) -> usize {
        self.entries().map(|e| e.len()).unwrap_or(0)
    }

    /// Total chunk bytes on disk (for stats/debugging).
    pub fn size(&self) -> u64 {
        self.usage().map(|(_, bytes)| bytes).unwrap_or(0)
    }

    /// Chunk count and total chunk bytes from a single scan.
    ///
    /// Blocking; async callers run it on `spawn_blocking`.
    pub fn usage(&self) -> Result<(usize, u64)> {
        let entries = self.entries()?;
        let bytes = entries
            .iter()
            .filter_map(|e| fs::metadata(&e.path).ok())
            .map(|m| m.len())
            .sum();
        Ok((entries.len(), bytes))
    }

    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("chunk");
        let tmp_path = self
            .root
            .join(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));

        let written = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(data).context("failed to write chunk data")?;
            file.sync_all().context("failed to sync chunk to disk")?;
            fs::rename(&tmp_path, path).with_context(|| {
                format!("failed to rename {} to {}", tmp_path.display(), path.display())
            })
        })();

        if written.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        written
    }
}

/// Read a whole file, through mmap when it is non-empty.
pub(crate) fn read_file(path: &Path) -> Result<Bytes> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open chunk: {}", path.display()))?;
    let len = file
        .metadata()
        .with_context(|| format!("failed to stat chunk: {}", path.display()))?
        .len();
    if len == 0 {
        return Ok(Bytes::new());
    }

    // Safety: file is opened read-only and we don't mutate the mmap
    let mmap = unsafe {
        Mmap::map(&file).with_context(|| format!("failed to mmap chunk: {}", path.display()))?
    };
    Ok(Bytes::copy_from_slice(&mmap))
}
