pub mod adamw;
pub mod grad_scaler;
pub mod optimizer;
pub mod sgd;

pub use adamw::{AdamW, AdamWConfig};
pub use grad_scaler::GradScaler;
pub use optimizer::{Optimizer, OptimizerState};
pub use sgd::Sgd;
