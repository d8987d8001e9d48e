use serde::{Serialize, Deserialize};

use crate::error::{Result, TptError};

/// Internal optimizer state, detached from the optimizer so it can be
/// snapshotted once and restored before every sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizerState {
    Sgd {
        momentum_buf: Option<Vec<f64>>,
    },
    AdamW {
        m: Vec<f64>,
        v: Vec<f64>,
        step: u64,
    },
}

/// First-order optimizer over a flat parameter slice.
pub trait Optimizer {
    /// Applies one update in place. `grads.len()` must equal `params.len()`.
    fn step(&mut self, params: &mut [f64], grads: &[f64]) -> Result<()>;

    fn state(&self) -> OptimizerState;

    /// Restores a state produced by `state()` on the same kind of optimizer.
    fn load_state(&mut self, state: &OptimizerState) -> Result<()>;

    fn learning_rate(&self) -> f64;
}

pub(crate) fn check_lengths(params: &[f64], grads: &[f64]) -> Result<()> {
    if params.len() != grads.len() {
        return Err(TptError::ShapeMismatch {
            context: "optimizer step",
            expected: (params.len(), 1),
            actual: (grads.len(), 1),
        });
    }
    Ok(())
}

pub(crate) fn wrong_state(expected: &str, got: &OptimizerState) -> TptError {
    TptError::Config(format!("cannot load {:?} state into a {} optimizer", got, expected))
}
