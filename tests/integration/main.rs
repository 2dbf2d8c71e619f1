//! fanout integration test harness.
//!
//! Every test runs real receivers in-process on 127.0.0.1 with an ephemeral
//! port and its own chunk directory, then drives them through the real TCP
//! transport. No root or external setup needed:
//!
//!   cargo test --test integration
//!
//! Each test owns the receivers and directories it creates.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use fanout_core::retry::RetryPolicy;
use fanout_services::{
    ChunkReceiver, ChunkStore, DispatchConfig, DispatchEngine, DispatchSummary, FileChunker,
    ReceivedSet, RpcServer, TcpTransport,
};

mod failures;
mod files;

// ── Harness ───────────────────────────────────────────────────────────────────

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Scratch directory removed on drop.
pub struct TestDir(PathBuf);

impl TestDir {
    pub fn new(tag: &str) -> Self {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "fanout-it-{tag}-{}-{}",
            std::process::id(),
            id
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// An in-process receiver node.
pub struct TestReceiver {
    pub addr: String,
    pub store: ChunkStore,
    pub received: ReceivedSet,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestReceiver {
    pub async fn start(chunk_dir: &Path) -> Result<Self> {
        let store = ChunkStore::new(chunk_dir)?;
        let received = ReceivedSet::new();
        let (shutdown, rx) = broadcast::channel(1);
        let server = RpcServer::bind(
            "127.0.0.1:0",
            Arc::new(ChunkReceiver::new(received.clone(), store.clone())),
            Duration::from_secs(10),
            rx,
        )
        .await?;
        let addr = server.local_addr()?.to_string();
        let task = tokio::spawn(server.run());
        Ok(Self {
            addr,
            store,
            received,
            shutdown,
            task,
        })
    }

    /// Signal shutdown and wait for the server to drain.
    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .context("receiver did not stop in time")?
            .context("receiver task panicked")?
    }
}

/// An address with nothing listening on it.
pub async fn dead_node() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

/// Deterministic, non-repeating-looking test content.
pub fn write_input(dir: &Path, name: &str, len: usize) -> PathBuf {
    let data: Vec<u8> = (0..len).map(|i| ((i * 7919) % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Dispatch settings with millisecond backoff so retries stay fast.
pub fn fast_config(nodes: &[&str], workers: usize, queue_capacity: usize) -> DispatchConfig {
    DispatchConfig {
        nodes: nodes.iter().map(|n| n.to_string()).collect(),
        workers,
        queue_capacity,
        retry: RetryPolicy {
            max_attempts: 5,
            backoff_unit: Duration::from_millis(10),
        },
        rpc_timeout: Duration::from_secs(5),
    }
}

pub struct Sent {
    pub file_id: String,
    pub total: u32,
    pub summary: DispatchSummary,
    pub progress: u64,
}

/// Split `path` and push every chunk through a fresh engine, the same way
/// `fanout-ctl send` does.
pub async fn send_file(path: &Path, chunk_size: usize, config: DispatchConfig) -> Result<Sent> {
    let chunker = FileChunker::open(path, chunk_size)?;
    let file_id = chunker.file_id().to_string();
    let total = chunker.total();

    let transport = Arc::new(TcpTransport::new(config.rpc_timeout));
    let mut engine = DispatchEngine::new(config, transport, total as u64)?;
    let progress = engine.progress();
    let queue = engine.queue();
    engine.run();

    let producer = tokio::task::spawn_blocking(move || -> Result<()> {
        for chunk in chunker {
            queue.blocking_enqueue(chunk?)?;
        }
        Ok(())
    });
    producer.await.context("producer panicked")??;

    let summary = engine.wait().await;
    Ok(Sent {
        file_id,
        total,
        summary,
        progress: progress.delivered(),
    })
}
