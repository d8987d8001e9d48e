use crate::math::matrix::Matrix;
use crate::math::stats::{log_softmax, logsumexp};

/// Entropy of the view-averaged prediction, the label-free TPT objective.
///
/// Input is a batch of per-view scores (logits or log-probabilities; each
/// row is log-softmaxed first). The average over views is taken in log
/// space:
///   ℓ_i = log_softmax(s_i)
///   a   = logsumexp_i(ℓ_i) - ln n,  clamped at f64::MIN
///   L   = -Σ_k a_k · exp(a_k)
pub struct MarginalEntropyLoss;

impl MarginalEntropyLoss {
    /// Log of the averaged distribution, `a` above.
    pub fn avg_log_probs(scores: &Matrix) -> Vec<f64> {
        let log_probs: Vec<Vec<f64>> = scores.data.iter().map(|r| log_softmax(r)).collect();
        let ln_n = (scores.rows as f64).ln();
        (0..scores.cols)
            .map(|k| {
                let column: Vec<f64> = log_probs.iter().map(|r| r[k]).collect();
                (logsumexp(&column) - ln_n).max(f64::MIN)
            })
            .collect()
    }

    pub fn loss(scores: &Matrix) -> f64 {
        -Self::avg_log_probs(scores).iter().map(|a| a * a.exp()).sum::<f64>()
    }

    /// ∂L/∂scores, same shape as `scores`.
    ///
    /// With p_i = softmax(s_i):
    ///   ∂L/∂ℓ_ik = -p_ik (a_k + 1) / n
    ///   ∂L/∂s_ik = ∂L/∂ℓ_ik - p_ik Σ_m ∂L/∂ℓ_im
    pub fn derivative(scores: &Matrix) -> Matrix {
        let avg = Self::avg_log_probs(scores);
        let n = scores.rows as f64;
        let mut grad = Matrix::zeros(scores.rows, scores.cols);

        for (i, row) in scores.data.iter().enumerate() {
            let probs: Vec<f64> = log_softmax(row).into_iter().map(f64::exp).collect();
            let g_log: Vec<f64> = probs.iter().zip(&avg)
                .map(|(p, a)| if *p == 0.0 { 0.0 } else { -p * (a + 1.0) / n })
                .collect();
            let total: f64 = g_log.iter().sum();
            for k in 0..scores.cols {
                grad.data[i][k] = g_log[k] - probs[k] * total;
            }
        }

        grad
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use crate::math::stats::entropy;

    fn m(rows: Vec<Vec<f64>>) -> Matrix {
        Matrix::from_rows(rows).unwrap()
    }

    #[test]
    fn equals_entropy_of_mean_distribution() {
        let probs = m(vec![vec![0.7, 0.2, 0.1], vec![0.1, 0.6, 0.3]]);
        let scores = probs.map(f64::ln);
        let mean = probs.mean_rows();
        assert_abs_diff_eq!(MarginalEntropyLoss::loss(&scores), entropy(&mean), epsilon = 1e-5);
    }

    #[test]
    fn agreeing_views_have_lower_loss_than_disagreeing() {
        let agree = m(vec![vec![5.0, 0.0, 0.0], vec![5.0, 0.0, 0.0]]);
        let disagree = m(vec![vec![5.0, 0.0, 0.0], vec![0.0, 5.0, 0.0]]);
        assert!(MarginalEntropyLoss::loss(&agree) < MarginalEntropyLoss::loss(&disagree));
    }

    #[test]
    fn survives_extreme_scores() {
        let scores = m(vec![vec![800.0, -800.0, 0.0], vec![900.0, -900.0, 0.0]]);
        let loss = MarginalEntropyLoss::loss(&scores);
        assert!(loss.is_finite());
        assert!(MarginalEntropyLoss::derivative(&scores).data.iter().flatten().all(|g| g.is_finite()));
    }

    #[test]
    fn derivative_matches_finite_differences() {
        let scores = m(vec![vec![1.0, 0.2, -0.5], vec![0.3, 0.9, 0.1], vec![-0.2, 0.0, 1.5]]);
        let grad = MarginalEntropyLoss::derivative(&scores);
        let h = 1e-6;
        for i in 0..3 {
            for k in 0..3 {
                let mut up = scores.clone();
                up.data[i][k] += h;
                let mut down = scores.clone();
                down.data[i][k] -= h;
                let numeric = (MarginalEntropyLoss::loss(&up) - MarginalEntropyLoss::loss(&down)) / (2.0 * h);
                assert_abs_diff_eq!(grad.data[i][k], numeric, epsilon = 1e-6);
            }
        }
    }
}
