//! Configuration system for fanout.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FANOUT_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/fanout/config.toml
//!   3. ~/.config/fanout/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::wire::{MAX_PAYLOAD_LEN, PROTOCOL_OVERHEAD};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Receiver endpoints as `host:port`. At least one is required to send.
    pub nodes: Vec<String>,
    /// Chunk size in MiB, before the protocol overhead is deducted.
    pub chunk_size_mib: u64,
    /// Bytes subtracted from each chunk for framing and metadata.
    pub protocol_overhead_bytes: u64,
    /// Concurrent delivery workers.
    pub workers: usize,
    /// Queue slots between the chunker and the workers. 0 = one per chunk.
    pub queue_capacity: usize,
    /// Deadline for a single delivery attempt.
    pub rpc_timeout_secs: u64,
    /// Attempts per chunk before it is declared permanently failed.
    pub max_attempts: u32,
    /// One backoff step, in milliseconds.
    pub backoff_unit_ms: u64,
    /// How often the progress display polls the counter.
    pub progress_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    pub listen_addr: String,
    pub port: u16,
    /// Directory chunk files are written to. Created if absent.
    pub chunk_dir: PathBuf,
    /// Close a connection that sends nothing for this long.
    pub idle_timeout_secs: u64,
    /// Interval between received-set stat lines. 0 = never.
    pub stats_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            chunk_size_mib: 4,
            protocol_overhead_bytes: PROTOCOL_OVERHEAD as u64,
            workers: 10,
            queue_capacity: 0,
            rpc_timeout_secs: 30,
            max_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            backoff_unit_ms: 1000,
            progress_interval_ms: 500,
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 12345,
            chunk_dir: PathBuf::from("./chunks"),
            idle_timeout_secs: 60,
            stats_interval_secs: 30,
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl SenderConfig {
    /// Payload bytes per chunk: MiB converted to bytes, minus overhead.
    pub fn chunk_size_bytes(&self) -> Result<usize, ConfigError> {
        let raw = self.chunk_size_mib.saturating_mul(1024 * 1024);
        if raw <= self.protocol_overhead_bytes {
            return Err(ConfigError::ChunkSizeTooSmall {
                chunk_size_mib: self.chunk_size_mib,
                overhead: self.protocol_overhead_bytes,
            });
        }
        let size = raw - self.protocol_overhead_bytes;
        if size > MAX_PAYLOAD_LEN {
            return Err(ConfigError::ChunkSizeTooLarge(self.chunk_size_mib));
        }
        Ok(size as usize)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            backoff_unit: Duration::from_millis(self.backoff_unit_ms),
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    /// Check everything a send needs before any file is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }
        if let Some(bad) = self.nodes.iter().find(|n| !n.contains(':')) {
            return Err(ConfigError::InvalidNode(bad.clone()));
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        self.chunk_size_bytes()?;
        Ok(())
    }
}

impl ReceiverConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("fanout")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("no receiver nodes specified")]
    NoNodes,
    #[error("node {0:?} is not a host:port endpoint")]
    InvalidNode(String),
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("chunk size {chunk_size_mib} MiB leaves no room after {overhead} bytes of overhead")]
    ChunkSizeTooSmall { chunk_size_mib: u64, overhead: u64 },
    #[error("chunk size {0} MiB exceeds the maximum frame payload")]
    ChunkSizeTooLarge(u64),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FanoutConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            FanoutConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FANOUT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        Self::write_default_to(&path)?;
        Ok(path)
    }

    pub fn write_default_to(path: &std::path::Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(&FanoutConfig::default())
            .map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Apply env var overrides. `lookup` is `std::env::var` in production
    /// and a map in tests, so tests never touch the process environment.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(p) = lookup("PORT").and_then(|v| v.parse().ok()) {
            self.receiver.port = p;
        }
        if let Some(v) = lookup("FANOUT_RECEIVER__LISTEN_ADDR") {
            self.receiver.listen_addr = v;
        }
        if let Some(v) = lookup("FANOUT_RECEIVER__CHUNK_DIR") {
            self.receiver.chunk_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FANOUT_SENDER__NODES") {
            self.sender.nodes = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(n) = lookup("FANOUT_SENDER__WORKERS").and_then(|v| v.parse().ok()) {
            self.sender.workers = n;
        }
        if let Some(n) = lookup("FANOUT_SENDER__CHUNK_SIZE_MIB").and_then(|v| v.parse().ok()) {
            self.sender.chunk_size_mib = n;
        }
    }
}
