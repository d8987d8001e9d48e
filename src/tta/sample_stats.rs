use std::sync::mpsc::Receiver;

use serde::{Serialize, Deserialize};
use tracing::info;

/// Per-sample progress emitted by the adaptation loop.
///
/// When a `progress_tx` channel is configured in `RunConfig`, the loop sends
/// one `SampleStats` after every processed sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleStats {
    /// Stream index of the sample.
    pub index: usize,
    /// Stream length, skipped samples included.
    pub total: usize,
    pub label: usize,
    pub prediction: usize,
    /// Marginal entropy before the optimizer step.
    pub adapt_loss: f64,
    /// Cross-entropy of the adapted canonical prediction.
    pub eval_loss: f64,
    /// Running top-1 / top-5 in percent.
    pub top1: f64,
    pub top5: f64,
    pub kept_views: usize,
    pub elapsed_ms: u64,
}

/// Drains a progress channel until every sender is gone, logging running
/// accuracy every `every` samples and on the last one. Returns how many
/// records were received.
pub fn log_progress(rx: Receiver<SampleStats>, every: usize) -> usize {
    let every = every.max(1);
    let mut received = 0;
    for stats in rx {
        received += 1;
        if received % every == 0 || stats.index + 1 == stats.total {
            info!(
                sample = stats.index + 1,
                total = stats.total,
                top1 = stats.top1,
                top5 = stats.top5,
                kept = stats.kept_views,
                ms = stats.elapsed_ms,
                "tta"
            );
        }
    }
    received
}
