use crate::math::stats::log_softmax;

/// Categorical cross-entropy on raw logits against an integer label.
///
/// Used only to score the adapted prediction; the label never reaches the
/// adaptation objective.
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    /// Computes the scalar cross-entropy loss:
    ///   L = -log_softmax(logits)[label]
    pub fn loss(logits: &[f64], label: usize) -> f64 {
        -log_softmax(logits)[label]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn uniform_logits_cost_log_c() {
        assert_abs_diff_eq!(CrossEntropyLoss::loss(&[0.0; 4], 2), 4f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn confident_correct_logit_costs_less() {
        let logits = [1.0, 4.0, 0.5];
        assert!(CrossEntropyLoss::loss(&logits, 1) < CrossEntropyLoss::loss(&logits, 0));
        assert!(CrossEntropyLoss::loss(&logits, 1) > 0.0);
    }
}
