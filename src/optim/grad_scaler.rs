use tracing::debug;

/// Dynamic loss scaling, as used for mixed-precision backprop.
///
/// The upstream gradient is multiplied by `scale` before backprop; the
/// resulting parameter gradients are divided by it again. A non-finite
/// gradient skips the optimizer step and halves the scale; `growth_interval`
/// clean steps in a row double it.
#[derive(Debug, Clone)]
pub struct GradScaler {
    pub scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: u32,
    clean_steps: u32,
}

impl GradScaler {
    pub fn new(init_scale: f64) -> Self {
        GradScaler {
            scale: init_scale,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            clean_steps: 0,
        }
    }

    pub fn scale_in_place(&self, values: &mut [f64]) {
        values.iter_mut().for_each(|v| *v *= self.scale);
    }

    /// Divides by the current scale. Returns `false` if any gradient is
    /// non-finite, in which case the step must be skipped.
    pub fn unscale(&self, grads: &mut [f64]) -> bool {
        let inv = 1.0 / self.scale;
        let mut finite = true;
        for g in grads.iter_mut() {
            *g *= inv;
            finite &= g.is_finite();
        }
        finite
    }

    /// Adjusts the scale after a step attempt.
    pub fn update(&mut self, found_non_finite: bool) {
        if found_non_finite {
            self.scale *= self.backoff_factor;
            self.clean_steps = 0;
            debug!(scale = self.scale, "non-finite gradient, backing off loss scale");
        } else {
            self.clean_steps += 1;
            if self.clean_steps >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.clean_steps = 0;
            }
        }
    }
}

impl Default for GradScaler {
    fn default() -> Self {
        GradScaler::new(1000.0)
    }
}
