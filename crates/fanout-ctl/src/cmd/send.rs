//! Send a file: split, fan out, report.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;

use fanout_services::{
    CancelHandle, DispatchConfig, DispatchEngine, DispatchError, FileChunker, TcpTransport,
};

use crate::progress::{format_bytes, ProgressDisplay};

#[derive(Args, Debug)]
pub struct SendArgs {
    /// File to distribute
    pub file: PathBuf,
    /// Receiver nodes as host:port, comma separated. Defaults to the config file.
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,
    /// Chunk size in MiB, before protocol overhead
    #[arg(long)]
    pub chunk_size: Option<u64>,
    /// Concurrent delivery workers
    #[arg(long)]
    pub workers: Option<usize>,
}

pub async fn run(args: SendArgs) -> Result<bool> {
    let mut config = super::load_config().sender;
    if !args.nodes.is_empty() {
        config.nodes = args.nodes;
    }
    if let Some(mib) = args.chunk_size {
        config.chunk_size_mib = mib;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    config.validate()?;
    let chunk_size = config.chunk_size_bytes()?;

    if !args.file.is_file() {
        bail!("{} is not a readable file", args.file.display());
    }

    let transport = Arc::new(TcpTransport::new(config.rpc_timeout()));
    for (node, ready, detail) in super::health::probe_nodes(transport.clone(), &config.nodes).await {
        if !ready {
            tracing::warn!(node = %node, detail = %detail, "node not ready, sending anyway");
        }
    }

    let chunker = FileChunker::open(&args.file, chunk_size)?;
    let total = chunker.total();
    let file_name = chunker.source_file_name().to_string();
    tracing::info!(
        file = %args.file.display(),
        file_id = chunker.file_id(),
        size = chunker.file_size(),
        chunk_size,
        chunks = total,
        nodes = config.nodes.len(),
        workers = config.workers,
        "sending file"
    );
    let file_id = chunker.file_id().to_string();
    let file_size = chunker.file_size();

    let mut engine = DispatchEngine::new(
        DispatchConfig::from_sender(&config, total),
        transport,
        total as u64,
    )?;
    let queue = engine.queue();
    let cancel = engine.cancel_handle();
    let display = ProgressDisplay::start(engine.progress(), &file_name, config.progress_interval());
    engine.run();

    let interrupt = tokio::spawn(cancel_on_interrupt(cancel.clone()));

    // Splitting reads the disk; keep it on a blocking thread feeding the queue.
    let producer = tokio::task::spawn_blocking(move || -> Result<()> {
        for chunk in chunker {
            match queue.blocking_enqueue(chunk?) {
                Ok(()) => {}
                Err(DispatchError::Cancelled) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    });

    let produced = producer.await.context("chunker thread panicked")?;
    if produced.is_err() {
        cancel.cancel();
    }
    let summary = engine.wait().await;
    interrupt.abort();
    display.finish(&summary);
    produced.with_context(|| format!("failed to split {}", args.file.display()))?;

    println!("  File     : {file_name} ({})", format_bytes(file_size));
    println!("  File id  : {file_id}");
    println!("  Chunks   : {total}");
    println!("  Delivered: {}", summary.delivered);
    if summary.failed > 0 {
        println!("  Failed   : {}", summary.failed);
        for failure in &summary.failures {
            println!(
                "    chunk {} after {} attempts: {}",
                failure.index, failure.attempts, failure.last_error
            );
        }
    }
    if summary.cancelled > 0 {
        println!("  Cancelled: {}", summary.cancelled);
    }

    Ok(summary.delivered == total as u64)
}

async fn cancel_on_interrupt(cancel: CancelHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::warn!("interrupted, cancelling transfer");
        cancel.cancel();
    }
}
