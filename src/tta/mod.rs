pub mod adapt_loop;
pub mod adapt_step;
pub mod checkpoint;
pub mod report;
pub mod run_config;
pub mod sample_stats;

pub use adapt_loop::{AdaptationLoop, LoopOutcome};
pub use adapt_step::{adapt_step, AdaptOutcome, CaptionEnsemble};
pub use checkpoint::Checkpoint;
pub use report::{MetricsWriter, RunSummary};
pub use run_config::{OptimizerKind, RunConfig};
pub use sample_stats::SampleStats;
