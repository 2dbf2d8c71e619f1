//! Node readiness probe.

use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use fanout_services::{ChunkTransport, TcpTransport};

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Receiver nodes as host:port, comma separated. Defaults to the config file.
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,
}

/// Probe every node concurrently. Returns `(node, ready, detail)` in node order.
pub async fn probe_nodes<T: ChunkTransport>(
    transport: Arc<T>,
    nodes: &[String],
) -> Vec<(String, bool, String)> {
    let probes: Vec<_> = nodes
        .iter()
        .cloned()
        .map(|node| {
            let transport = transport.clone();
            tokio::spawn(async move {
                let (ready, detail) = match transport.health_check(&node).await {
                    Ok(true) => (true, "ready".to_string()),
                    Ok(false) => (false, "not ready".to_string()),
                    Err(e) => (false, e.to_string()),
                };
                (node, ready, detail)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(probes.len());
    for (probe, node) in probes.into_iter().zip(nodes) {
        match probe.await {
            Ok(r) => results.push(r),
            Err(e) => results.push((node.clone(), false, format!("probe failed: {e}"))),
        }
    }
    results
}

pub async fn run(args: HealthArgs) -> Result<bool> {
    let mut config = super::load_config().sender;
    if !args.nodes.is_empty() {
        config.nodes = args.nodes;
    }
    if config.nodes.is_empty() {
        anyhow::bail!("no receiver nodes given (use --nodes or set sender.nodes)");
    }

    let transport = Arc::new(TcpTransport::new(config.rpc_timeout()));
    let results = probe_nodes(transport, &config.nodes).await;

    let mut all_ready = true;
    for (node, ready, detail) in &results {
        let mark = if *ready { "✓" } else { "✗" };
        println!("  {mark} {node:<24} {detail}");
        all_ready &= *ready;
    }
    Ok(all_ready)
}
