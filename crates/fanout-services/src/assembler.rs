//! Assembler: rebuilds files from a chunk directory.
//!
//! Offline pass. Chunk files are grouped by file id and concatenated in
//! index order into `{output_prefix}_{file_id}`, hashing as they go. A file
//! is only written if its chunk run is complete: contiguous from 0 and, when
//! the receiver left a manifest, exactly `total_chunks` long. Output goes to
//! a temp path first, so a failed file leaves nothing behind. Each file
//! succeeds or fails on its own.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;

use fanout_core::crypto::Checksummer;

use crate::chunk_store::{read_file, ChunkEntry, ChunkStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyReport {
    pub file_id: String,
    /// Source file name from the manifest, if one was found.
    pub file_name: Option<String>,
    pub chunks: u32,
    pub bytes: u64,
    /// Hex SHA-256 of the assembled output.
    pub checksum: String,
    pub output: PathBuf,
}

#[derive(Debug, Default)]
pub struct AssemblySummary {
    pub assembled: Vec<AssemblyReport>,
    pub failed: Vec<(String, AssemblyError)>,
}

impl AssemblySummary {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("chunk {expected} is missing (next present is {found})")]
    Gap { expected: u32, found: u32 },

    #[error("only {found} of {expected} chunks present")]
    Incomplete { found: u32, expected: u32 },

    #[error("unreadable manifest: {0}")]
    Manifest(String),

    #[error("unreadable chunk {index}: {message}")]
    UnreadableChunk { index: u32, message: String },

    #[error("failed to write {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct Assembler {
    store: ChunkStore,
}

impl Assembler {
    /// Open an existing chunk directory.
    pub fn open(chunk_dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: ChunkStore::open(chunk_dir)?,
        })
    }

    pub fn from_store(store: ChunkStore) -> Self {
        Self { store }
    }

    /// Assemble every file found in the directory.
    ///
    /// Errors only if the directory cannot be scanned; per-file failures
    /// land in the summary.
    pub fn assemble_all(&self, output_prefix: &Path) -> Result<AssemblySummary> {
        let mut groups: BTreeMap<String, BTreeMap<u32, ChunkEntry>> = BTreeMap::new();
        for entry in self.store.entries()? {
            groups
                .entry(entry.file_id.clone())
                .or_default()
                .insert(entry.index, entry);
        }
        tracing::info!(
            dir = %self.store.root().display(),
            files = groups.len(),
            "assembling"
        );

        let mut summary = AssemblySummary::default();
        for (file_id, chunks) in groups {
            match self.assemble_file(&file_id, &chunks, output_prefix) {
                Ok(report) => {
                    tracing::info!(
                        file_id = %report.file_id,
                        chunks = report.chunks,
                        bytes = report.bytes,
                        checksum = %report.checksum,
                        output = %report.output.display(),
                        "file assembled"
                    );
                    summary.assembled.push(report);
                }
                Err(e) => {
                    tracing::error!(file_id = %file_id, error = %e, "assembly failed");
                    summary.failed.push((file_id, e));
                }
            }
        }
        Ok(summary)
    }

    fn assemble_file(
        &self,
        file_id: &str,
        chunks: &BTreeMap<u32, ChunkEntry>,
        output_prefix: &Path,
    ) -> Result<AssemblyReport, AssemblyError> {
        // BTreeMap keys are sorted, so index i must be the i-th key.
        for (position, index) in chunks.keys().enumerate() {
            let expected = position as u32;
            if *index != expected {
                return Err(AssemblyError::Gap {
                    expected,
                    found: *index,
                });
            }
        }
        let found = chunks.len() as u32;

        let manifest = self
            .store
            .read_manifest(file_id)
            .map_err(|e| AssemblyError::Manifest(format!("{e:#}")))?;
        if let Some(m) = &manifest {
            if m.total_chunks != found {
                return Err(AssemblyError::Incomplete {
                    found,
                    expected: m.total_chunks,
                });
            }
        } else {
            tracing::warn!(file_id, chunks = found, "no manifest, trailing chunks cannot be verified");
        }

        let output = output_path(output_prefix, file_id);
        let tmp = with_suffix(&output, &format!(".{}.partial", std::process::id()));
        let written = write_concatenated(&tmp, chunks.values());
        let (bytes, checksum) = match written {
            Ok(w) => w,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
        };
        if let Err(source) = fs::rename(&tmp, &output) {
            let _ = fs::remove_file(&tmp);
            return Err(AssemblyError::Output {
                path: output,
                source,
            });
        }

        Ok(AssemblyReport {
            file_id: file_id.to_string(),
            file_name: manifest.map(|m| m.file_name),
            chunks: found,
            bytes,
            checksum,
            output,
        })
    }
}

fn write_concatenated<'a>(
    path: &Path,
    chunks: impl Iterator<Item = &'a ChunkEntry>,
) -> Result<(u64, String), AssemblyError> {
    let out_err = |source| AssemblyError::Output {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(out_err)?;
    }
    let mut out = fs::File::create(path).map_err(out_err)?;
    let mut hasher = Checksummer::new();
    let mut bytes = 0u64;

    for entry in chunks {
        let data = read_file(&entry.path).map_err(|e| AssemblyError::UnreadableChunk {
            index: entry.index,
            message: format!("{e:#}"),
        })?;
        hasher.update(&data);
        out.write_all(&data).map_err(out_err)?;
        bytes += data.len() as u64;
    }
    out.sync_all().map_err(out_err)?;
    Ok((bytes, hasher.finalize()))
}

/// `{prefix}_{file_id}`
pub fn output_path(prefix: &Path, file_id: &str) -> PathBuf {
    with_suffix(prefix, &format!("_{file_id}"))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}
