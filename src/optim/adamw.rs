use crate::error::Result;
use crate::optim::optimizer::{check_lengths, wrong_state, Optimizer, OptimizerState};

/// AdamW hyperparameters.
#[derive(Clone, Debug)]
pub struct AdamWConfig {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        AdamWConfig {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// AdamW (decoupled weight decay) over one flat parameter group.
///
/// Moment buffers are allocated lazily on the first step, so a freshly built
/// optimizer and its `state()` snapshot describe "no steps taken".
#[derive(Clone, Debug)]
pub struct AdamW {
    pub learning_rate: f64,
    pub config: AdamWConfig,
    m: Vec<f64>,
    v: Vec<f64>,
    step: u64,
}

impl AdamW {
    pub fn new(learning_rate: f64, config: AdamWConfig) -> Self {
        AdamW { learning_rate, config, m: Vec::new(), v: Vec::new(), step: 0 }
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, params: &mut [f64], grads: &[f64]) -> Result<()> {
        check_lengths(params, grads)?;
        if self.m.len() != params.len() {
            self.m = vec![0.0; params.len()];
            self.v = vec![0.0; params.len()];
        }
        self.step += 1;

        let AdamWConfig { beta1, beta2, eps, weight_decay } = self.config;
        let bc1_inv = 1.0 / (1.0 - beta1.powi(self.step as i32));
        let bc2_inv = 1.0 / (1.0 - beta2.powi(self.step as i32));
        let lr = self.learning_rate;

        for i in 0..params.len() {
            let g = grads[i];
            self.m[i] = beta1 * self.m[i] + (1.0 - beta1) * g;
            self.v[i] = beta2 * self.v[i] + (1.0 - beta2) * g * g;
            let m_hat = self.m[i] * bc1_inv;
            let v_hat = self.v[i] * bc2_inv;
            params[i] -= lr * (m_hat / (v_hat.sqrt() + eps) + weight_decay * params[i]);
        }
        Ok(())
    }

    fn state(&self) -> OptimizerState {
        OptimizerState::AdamW { m: self.m.clone(), v: self.v.clone(), step: self.step }
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        match state {
            OptimizerState::AdamW { m, v, step } => {
                self.m.clone_from(m);
                self.v.clone_from(v);
                self.step = *step;
                Ok(())
            }
            other => Err(wrong_state("adamw", other)),
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}
