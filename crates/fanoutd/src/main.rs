//! fanoutd: fanout receiver daemon.
//!
//! Accepts chunks over TCP and persists them into the configured chunk
//! directory. Usage: `fanoutd [chunk_dir]`; everything else comes from the
//! config file and environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use fanout_core::config::FanoutConfig;
use fanout_services::{ChunkReceiver, ChunkStore, ReceivedSet, RpcServer};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load config
    if let Err(e) = FanoutConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = FanoutConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        let mut config = FanoutConfig::default();
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    });
    if let Some(dir) = std::env::args().nth(1) {
        config.receiver.chunk_dir = PathBuf::from(dir);
    }
    let receiver_config = config.receiver;

    let store = ChunkStore::new(&receiver_config.chunk_dir)?;
    let received = ReceivedSet::new();
    tracing::info!(
        chunk_dir = %store.root().display(),
        existing_chunks = store.count(),
        "chunk store ready"
    );

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let server = RpcServer::bind(
        &receiver_config.bind_addr(),
        Arc::new(ChunkReceiver::new(received.clone(), store.clone())),
        receiver_config.idle_timeout(),
        shutdown_tx.subscribe(),
    )
    .await?;
    tracing::info!(addr = %server.local_addr()?, "fanoutd listening");

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let stats_printer = (receiver_config.stats_interval_secs > 0).then(|| {
        let period = Duration::from_secs(receiver_config.stats_interval_secs);
        let received = received.clone();
        let store = store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let scanned = store.clone();
                match tokio::task::spawn_blocking(move || scanned.usage()).await {
                    Ok(Ok((chunks, bytes))) => {
                        tracing::info!(chunks, bytes, "chunk store snapshot");
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "failed to scan chunk store"),
                    Err(e) => tracing::warn!(error = %e, "chunk store scan panicked"),
                }
                received.log_stats();
            }
        })
    });

    let result = server.run().await.context("rpc server failed");

    if let Some(task) = stats_printer {
        task.abort();
    }
    received.log_stats();
    tracing::info!("fanoutd stopped");
    result
}

/// Resolves on SIGINT, or SIGTERM where supported.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
        }
    }
    tokio::signal::ctrl_c().await.ok();
}
