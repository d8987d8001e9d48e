pub mod error;
pub mod logging;
pub mod math;
pub mod stats;
pub mod filter;
pub mod ensemble;
pub mod loss;
pub mod model;
pub mod optim;
pub mod data;
pub mod tta;

// Convenience re-exports
pub use error::{Result, TptError};
pub use math::matrix::Matrix;
pub use stats::{AverageMeter, RunningStats};
pub use filter::filter_on_entropy;
pub use ensemble::{CaptionBridge, EnsemblePolicy};
pub use loss::MarginalEntropyLoss;
pub use model::{Backbone, Captioner, Device, PromptClassifier, PrototypeCaptioner};
pub use optim::{AdamW, GradScaler, Optimizer, Sgd};
pub use data::{AugmentedStream, DatasetKind, ImageFolder, Sample, TestStream, VecStream};
pub use tta::{adapt_step, AdaptationLoop, CaptionEnsemble, Checkpoint, LoopOutcome, RunConfig};
