use crate::error::Result;
use crate::optim::optimizer::{check_lengths, wrong_state, Optimizer, OptimizerState};

/// SGD with optional heavy-ball momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    momentum_buf: Option<Vec<f64>>,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Sgd {
        Sgd { learning_rate, momentum: 0.0, weight_decay: 0.0, momentum_buf: None }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Sgd {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    /// `v ← μ·v + (g + λ·p)`, `p ← p - lr·v` (plain SGD when μ = 0).
    fn step(&mut self, params: &mut [f64], grads: &[f64]) -> Result<()> {
        check_lengths(params, grads)?;
        let d_p: Vec<f64> = grads.iter().zip(params.iter())
            .map(|(g, p)| g + self.weight_decay * p)
            .collect();

        let update = if self.momentum > 0.0 {
            let buf = match self.momentum_buf.take() {
                Some(mut buf) => {
                    for (b, d) in buf.iter_mut().zip(&d_p) {
                        *b = self.momentum * *b + d;
                    }
                    buf
                }
                None => d_p,
            };
            &*self.momentum_buf.insert(buf)
        } else {
            &d_p
        };

        for (p, u) in params.iter_mut().zip(update) {
            *p -= self.learning_rate * u;
        }
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState::Sgd { momentum_buf: self.momentum_buf.clone() }
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        match state {
            OptimizerState::Sgd { momentum_buf } => {
                self.momentum_buf = momentum_buf.clone();
                Ok(())
            }
            other => Err(wrong_state("sgd", other)),
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}
