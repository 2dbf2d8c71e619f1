//! Dispatch engine: fans chunks out to receiver nodes.
//!
//! A single bounded queue feeds a fixed pool of workers. Producers block
//! when the queue is full; workers block when it is empty. Each worker owns
//! one chunk at a time and drives its `DeliveryMachine` to a terminal state:
//! rotate nodes, back off, give up after the retry ceiling. A failed chunk
//! never stops the engine or any other chunk.
//!
//! Lifecycle:
//!   new → queue()/enqueue … → run → wait (closes queue, drains, summarises)
//!
//! Cancellation is observed between attempts and during backoff sleeps.
//! Whatever a worker holds at that point, and everything still queued, is
//! counted as cancelled without being attempted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;

use fanout_core::chunk::Chunk;
use fanout_core::config::SenderConfig;
use fanout_core::retry::{AttemptOutcome, DeliveryMachine, RetryPolicy, Transition};

use crate::transport::{ChunkTransport, TransportError};

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Receiver addresses, `host:port`. Attempt N goes to `nodes[N % len]`.
    pub nodes: Vec<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    /// Deadline for a single send call. Exceeding it is a transport failure.
    pub rpc_timeout: Duration,
}

impl DispatchConfig {
    /// Build from the sender section of the config file.
    ///
    /// A configured capacity of zero means "room for the whole file".
    pub fn from_sender(config: &SenderConfig, total_chunks: u32) -> Self {
        let queue_capacity = match config.queue_capacity {
            0 => (total_chunks as usize).max(1),
            n => n,
        };
        Self {
            nodes: config.nodes.clone(),
            workers: config.workers,
            queue_capacity,
            retry: config.retry_policy(),
            rpc_timeout: config.rpc_timeout(),
        }
    }

    fn validate(&self) -> Result<(), DispatchError> {
        if self.nodes.is_empty() {
            return Err(DispatchError::EmptyNodeList);
        }
        if self.workers == 0 {
            return Err(DispatchError::ZeroWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(DispatchError::ZeroCapacity);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("node list is empty")]
    EmptyNodeList,

    #[error("worker count must be at least 1")]
    ZeroWorkers,

    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    #[error("dispatch was cancelled")]
    Cancelled,

    #[error("dispatch queue is closed")]
    QueueClosed,
}

// ── Progress ──────────────────────────────────────────────────────────────────

/// Delivered-chunk counter shared between workers and the display.
///
/// Only ever incremented, once per delivered chunk, so it never decreases
/// and never exceeds `total`.
#[derive(Debug, Clone)]
pub struct Progress {
    delivered: Arc<AtomicU64>,
    total: u64,
}

impl Progress {
    pub fn new(total: u64) -> Self {
        Self {
            delivered: Arc::new(AtomicU64::new(0)),
            total,
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.delivered() >= self.total
    }

    fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
}

// ── Summary ───────────────────────────────────────────────────────────────────

/// A chunk that exhausted its retry ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFailure {
    pub file_id: String,
    pub index: u32,
    pub attempts: u32,
    pub last_error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub failures: Vec<ChunkFailure>,
}

impl DispatchSummary {
    fn merge(&mut self, other: DispatchSummary) {
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
        self.failures.extend(other.failures);
    }
}

// ── Queue handle ──────────────────────────────────────────────────────────────

/// Producer side of the engine's queue. Cheap to clone.
///
/// The queue stays open while any handle is alive, so producers must drop
/// their handles before `DispatchEngine::wait` can finish.
#[derive(Clone)]
pub struct ChunkQueue {
    tx: mpsc::Sender<Chunk>,
    cancel: watch::Receiver<bool>,
}

impl ChunkQueue {
    /// Add a chunk, waiting while the queue is full.
    pub async fn enqueue(&self, chunk: Chunk) -> Result<(), DispatchError> {
        let mut cancel = self.cancel.clone();
        if *cancel.borrow() {
            return Err(DispatchError::Cancelled);
        }
        tokio::select! {
            sent = self.tx.send(chunk) => sent.map_err(|_| DispatchError::QueueClosed),
            _ = cancelled(&mut cancel) => Err(DispatchError::Cancelled),
        }
    }

    /// Blocking variant for producers on a plain thread. Must not be called
    /// from inside the async runtime.
    pub fn blocking_enqueue(&self, chunk: Chunk) -> Result<(), DispatchError> {
        if *self.cancel.borrow() {
            return Err(DispatchError::Cancelled);
        }
        self.tx
            .blocking_send(chunk)
            .map_err(|_| DispatchError::QueueClosed)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Requests cancellation of a running dispatch.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Resolves once cancellation is requested. Never resolves if the sender
/// is gone without having cancelled.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// A chunk in flight together with its retry state.
struct TransferJob {
    chunk: Chunk,
    machine: DeliveryMachine,
}

enum JobOutcome {
    Delivered,
    Failed(ChunkFailure),
    Cancelled,
}

struct Shared<T> {
    nodes: Vec<String>,
    retry: RetryPolicy,
    rpc_timeout: Duration,
    transport: Arc<T>,
    queue: Mutex<mpsc::Receiver<Chunk>>,
    progress: Progress,
}

pub struct DispatchEngine<T: ChunkTransport> {
    shared: Arc<Shared<T>>,
    workers: usize,
    tx: mpsc::Sender<Chunk>,
    cancel: Arc<watch::Sender<bool>>,
    running: JoinSet<DispatchSummary>,
    started: bool,
}

impl<T: ChunkTransport> DispatchEngine<T> {
    /// Build an engine. `total` is the number of chunks the caller intends
    /// to enqueue and only feeds the progress display.
    pub fn new(config: DispatchConfig, transport: Arc<T>, total: u64) -> Result<Self, DispatchError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (cancel, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                nodes: config.nodes,
                retry: config.retry,
                rpc_timeout: config.rpc_timeout,
                transport,
                queue: Mutex::new(rx),
                progress: Progress::new(total),
            }),
            workers: config.workers,
            tx,
            cancel: Arc::new(cancel),
            running: JoinSet::new(),
            started: false,
        })
    }

    pub fn queue(&self) -> ChunkQueue {
        ChunkQueue {
            tx: self.tx.clone(),
            cancel: self.cancel.subscribe(),
        }
    }

    pub async fn enqueue(&self, chunk: Chunk) -> Result<(), DispatchError> {
        self.queue().enqueue(chunk).await
    }

    pub fn progress(&self) -> Progress {
        self.shared.progress.clone()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: self.cancel.clone(),
        }
    }

    /// Start the worker pool. Calling it again is a no-op.
    pub fn run(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        tracing::info!(
            workers = self.workers,
            nodes = self.shared.nodes.len(),
            "dispatch starting"
        );
        for id in 0..self.workers {
            self.running
                .spawn(worker(id, self.shared.clone(), self.cancel.subscribe()));
        }
    }

    /// Close the queue and wait for every worker to finish.
    ///
    /// Never fails because chunks failed; compare `delivered` with the
    /// number enqueued.
    pub async fn wait(mut self) -> DispatchSummary {
        self.run();
        drop(self.tx);

        let mut summary = DispatchSummary::default();
        while let Some(done) = self.running.join_next().await {
            match done {
                Ok(tally) => summary.merge(tally),
                Err(e) => tracing::error!(error = %e, "dispatch worker panicked"),
            }
        }
        tracing::info!(
            delivered = summary.delivered,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "dispatch finished"
        );
        summary
    }
}

async fn worker<T: ChunkTransport>(
    id: usize,
    shared: Arc<Shared<T>>,
    mut cancel: watch::Receiver<bool>,
) -> DispatchSummary {
    let mut tally = DispatchSummary::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            chunk = async { shared.queue.lock().await.recv().await } => chunk,
        };
        let Some(chunk) = next else {
            tracing::debug!(worker = id, "queue drained, worker exiting");
            return tally;
        };

        let job = TransferJob {
            machine: DeliveryMachine::new(shared.retry, shared.nodes.len()),
            chunk,
        };
        match deliver(&shared, job, &mut cancel).await {
            JobOutcome::Delivered => tally.delivered += 1,
            JobOutcome::Failed(failure) => {
                tally.failed += 1;
                tally.failures.push(failure);
            }
            JobOutcome::Cancelled => {
                tally.cancelled += 1;
                break;
            }
        }
    }

    // Cancelled: keep pulling so blocked producers wake, but attempt nothing.
    while let Some(_chunk) = shared.queue.lock().await.recv().await {
        tally.cancelled += 1;
    }
    tracing::debug!(worker = id, cancelled = tally.cancelled, "worker cancelled");
    tally
}

async fn deliver<T: ChunkTransport>(
    shared: &Shared<T>,
    mut job: TransferJob,
    cancel: &mut watch::Receiver<bool>,
) -> JobOutcome {
    loop {
        if *cancel.borrow() {
            return JobOutcome::Cancelled;
        }
        let Some(node_index) = job.machine.begin_attempt() else {
            // Unreachable: terminal transitions return below.
            return JobOutcome::Cancelled;
        };
        let node = &shared.nodes[node_index];
        let attempt = job.machine.attempts() + 1;

        let outcome = match send_with_deadline(shared, node, &job.chunk).await {
            Ok(ack) if ack.success => AttemptOutcome::Delivered,
            Ok(ack) => AttemptOutcome::Rejected(ack.message),
            Err(e) if e.is_transport() => AttemptOutcome::TransportFailed(e.to_string()),
            Err(e) => AttemptOutcome::Rejected(e.to_string()),
        };

        match job.machine.complete(outcome) {
            Transition::Delivered => {
                shared.progress.record_delivery();
                tracing::debug!(
                    file_id = %job.chunk.file_id,
                    index = job.chunk.index,
                    node = %node,
                    attempt,
                    "chunk delivered"
                );
                return JobOutcome::Delivered;
            }
            Transition::Retry { backoff } => {
                tracing::warn!(
                    file_id = %job.chunk.file_id,
                    index = job.chunk.index,
                    node = %node,
                    attempt,
                    error = job.machine.last_error().unwrap_or_default(),
                    backoff_ms = backoff.as_millis() as u64,
                    "delivery attempt failed"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancelled(cancel) => return JobOutcome::Cancelled,
                }
            }
            Transition::Exhausted => {
                let last_error = job.machine.last_error().unwrap_or_default().to_string();
                tracing::error!(
                    file_id = %job.chunk.file_id,
                    index = job.chunk.index,
                    attempts = job.machine.attempts(),
                    error = %last_error,
                    "chunk permanently failed"
                );
                return JobOutcome::Failed(ChunkFailure {
                    file_id: job.chunk.file_id,
                    index: job.chunk.index,
                    attempts: job.machine.attempts(),
                    last_error,
                });
            }
        }
    }
}

async fn send_with_deadline<T: ChunkTransport>(
    shared: &Shared<T>,
    node: &str,
    chunk: &Chunk,
) -> Result<crate::service::Ack, TransportError> {
    match tokio::time::timeout(shared.rpc_timeout, shared.transport.send_chunk(node, chunk)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout {
            node: node.to_string(),
            after: shared.rpc_timeout,
        }),
    }
}
