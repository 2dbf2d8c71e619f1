//! Transfer progress display.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

use fanout_services::{DispatchSummary, Progress};

/// Polls the engine's delivered counter on a fixed interval and renders it.
pub struct ProgressDisplay {
    bar: ProgressBar,
    poller: JoinHandle<()>,
    progress: Progress,
}

impl ProgressDisplay {
    pub fn start(progress: Progress, file_name: &str, interval: Duration) -> Self {
        let bar = ProgressBar::new(progress.total());
        let style = ProgressStyle::with_template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} chunks ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
        bar.set_style(style);
        bar.set_message(format!("Sending: {file_name}"));

        let poller = {
            let bar = bar.clone();
            let progress = progress.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    bar.set_position(progress.delivered());
                }
            })
        };

        Self {
            bar,
            poller,
            progress,
        }
    }

    pub fn finish(self, summary: &DispatchSummary) {
        self.poller.abort();
        self.bar.set_position(self.progress.delivered());
        if summary.delivered == self.progress.total() {
            self.bar.finish_with_message("Transfer complete");
        } else {
            self.bar.abandon_with_message(format!(
                "Transfer incomplete: {} failed, {} cancelled",
                summary.failed, summary.cancelled
            ));
        }
    }
}

/// Format bytes in human-readable form.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[unit])
    }
}
