//! Offline reassembly of a chunk directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use fanout_services::Assembler;

use crate::progress::format_bytes;

#[derive(Args, Debug)]
pub struct AssembleArgs {
    /// Directory holding `{file_id}_{index}.chunk` files
    pub chunk_dir: PathBuf,
    /// Each file is written to `{output_prefix}_{file_id}`
    pub output_prefix: PathBuf,
}

pub async fn run(args: AssembleArgs) -> Result<bool> {
    let summary = tokio::task::spawn_blocking(move || {
        Assembler::open(&args.chunk_dir)?.assemble_all(&args.output_prefix)
    })
    .await
    .context("assembler thread panicked")??;

    if summary.assembled.is_empty() && summary.failed.is_empty() {
        println!("No chunk files found.");
        return Ok(true);
    }

    for report in &summary.assembled {
        println!("  ✓ {}", report.output.display());
        if let Some(name) = &report.file_name {
            println!("      source   : {name}");
        }
        println!("      chunks   : {}", report.chunks);
        println!("      size     : {}", format_bytes(report.bytes));
        println!("      sha256   : {}", report.checksum);
    }
    for (file_id, error) in &summary.failed {
        println!("  ✗ {file_id}: {error}");
    }

    Ok(summary.is_success())
}
