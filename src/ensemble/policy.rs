use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Deserialize};

use crate::error::{Result, TptError};
use crate::math::matrix::{l2_norm, Matrix};
use crate::math::stats::{entropy, std_dev};

/// The only top-k the `StdDev` policy is calibrated for (the ImageNet-A
/// class subset).
pub const STD_DEV_TOP_K: usize = 200;

/// Scale applied to the normalized caption standard deviation by `StdDev`.
const STD_DEV_SCALE: f64 = 0.08;

/// How image-branch and caption-branch distributions are combined.
///
/// - `Entropy`      — confidence-weighted average, `1 / (1 + H)` per branch.
/// - `StdDev`       — image plus caption scaled by its relative spread.
/// - `HarmonicMean` — per-class harmonic mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsemblePolicy {
    #[default]
    Entropy,
    StdDev,
    HarmonicMean,
}

impl EnsemblePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnsemblePolicy::Entropy => "entropy",
            EnsemblePolicy::StdDev => "std_dev",
            EnsemblePolicy::HarmonicMean => "harmonic_mean",
        }
    }

    /// Fuses two same-shape batches of distributions row by row.
    ///
    /// `top_k` is the class slice the scores cover; only `StdDev` depends on
    /// it and rejects anything but [`STD_DEV_TOP_K`].
    pub fn fuse(&self, image: &Matrix, caption: &Matrix, top_k: usize) -> Result<Fusion> {
        image.ensure_same_shape(caption, "EnsemblePolicy::fuse")?;

        let mut probs = Matrix::zeros(image.rows, image.cols);
        let mut coefs = Vec::with_capacity(image.rows);

        match self {
            EnsemblePolicy::Entropy => {
                for (i, (img, cap)) in image.data.iter().zip(&caption.data).enumerate() {
                    let (wa, wb) = entropy_weights(img, cap);
                    for j in 0..image.cols {
                        probs.data[i][j] = wa * img[j] + wb * cap[j];
                    }
                    coefs.push((wa, wb));
                }
            }
            EnsemblePolicy::StdDev => {
                if top_k != STD_DEV_TOP_K {
                    return Err(TptError::UnsupportedTopK { expected: STD_DEV_TOP_K, actual: top_k });
                }
                if image.cols != top_k {
                    return Err(TptError::ShapeMismatch {
                        context: "std_dev fusion",
                        expected: (image.rows, top_k),
                        actual: image.shape(),
                    });
                }
                for (i, (img, cap)) in image.data.iter().zip(&caption.data).enumerate() {
                    let spread = [std_dev(img), std_dev(cap)];
                    let wb = STD_DEV_SCALE * spread[1] / l2_norm(&spread).max(1e-12);
                    for j in 0..image.cols {
                        probs.data[i][j] = img[j] + wb * cap[j];
                    }
                    coefs.push((1.0, wb));
                }
            }
            EnsemblePolicy::HarmonicMean => {
                for (i, (img, cap)) in image.data.iter().zip(&caption.data).enumerate() {
                    for j in 0..image.cols {
                        probs.data[i][j] = harmonic(img[j], cap[j]);
                    }
                }
            }
        }

        Ok(Fusion { policy: *self, probs, coefs })
    }
}

impl fmt::Display for EnsemblePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnsemblePolicy {
    type Err = TptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "entropy" => Ok(EnsemblePolicy::Entropy),
            "std_dev" => Ok(EnsemblePolicy::StdDev),
            "harmonic_mean" => Ok(EnsemblePolicy::HarmonicMean),
            other => Err(TptError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Normalized `(image, caption)` weights of the entropy policy; they sum to 1.
pub fn entropy_weights(image: &[f64], caption: &[f64]) -> (f64, f64) {
    let a = 1.0 / (1.0 + entropy(image));
    let b = 1.0 / (1.0 + entropy(caption));
    (a / (a + b), b / (a + b))
}

fn harmonic(a: f64, b: f64) -> f64 {
    let s = a + b;
    if s <= 0.0 { 0.0 } else { 2.0 * a * b / s }
}

/// Result of fusing a batch, plus what is needed to push a gradient back to
/// the image branch.
#[derive(Debug, Clone)]
pub struct Fusion {
    pub policy: EnsemblePolicy,
    pub probs: Matrix,
    /// Per-row `(image, caption)` coefficients of the linear policies.
    coefs: Vec<(f64, f64)>,
}

impl Fusion {
    /// Maps `∂L/∂fused` to `∂L/∂image`.
    ///
    /// The caption branch and the fusion weights are constants here: the
    /// caption scores come from a frozen model and the weights are computed
    /// from detached scalars.
    pub fn image_gradient(&self, image: &Matrix, caption: &Matrix, upstream: &Matrix) -> Matrix {
        match self.policy {
            EnsemblePolicy::Entropy | EnsemblePolicy::StdDev => {
                let mut grad = upstream.clone();
                for (row, &(wa, _)) in grad.data.iter_mut().zip(&self.coefs) {
                    row.iter_mut().for_each(|g| *g *= wa);
                }
                grad
            }
            EnsemblePolicy::HarmonicMean => {
                let mut grad = Matrix::zeros(upstream.rows, upstream.cols);
                for i in 0..upstream.rows {
                    for j in 0..upstream.cols {
                        let (a, b) = (image.data[i][j], caption.data[i][j]);
                        let s = a + b;
                        if s > 0.0 {
                            grad.data[i][j] = upstream.data[i][j] * 2.0 * b * b / (s * s);
                        }
                    }
                }
                grad
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn m(rows: Vec<Vec<f64>>) -> Matrix {
        Matrix::from_rows(rows).unwrap()
    }

    #[test]
    fn harmonic_mean_of_equal_inputs_is_identity() {
        let cases = vec![
            vec![0.2, 0.3, 0.5],
            vec![1.0, 0.0, 0.0],
            vec![1.0 / 3.0; 3],
        ];
        for a in cases {
            let x = m(vec![a.clone()]);
            let fused = EnsemblePolicy::HarmonicMean.fuse(&x, &x, 3).unwrap();
            for (f, e) in fused.probs.row(0).iter().zip(&a) {
                assert_abs_diff_eq!(*f, *e, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn entropy_weights_sum_to_one() {
        let pairs = [
            (vec![0.9, 0.05, 0.05], vec![0.3, 0.3, 0.4]),
            (vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]),
            (vec![0.5, 0.5, 0.0], vec![0.2, 0.2, 0.6]),
        ];
        for (a, b) in pairs {
            let (wa, wb) = entropy_weights(&a, &b);
            assert_abs_diff_eq!(wa + wb, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn confident_image_dominates_entropy_fusion() {
        let image = m(vec![vec![1.0, 0.0, 0.0]]);
        let caption = m(vec![vec![0.2, 0.5, 0.3]]);
        let fused = EnsemblePolicy::Entropy.fuse(&image, &caption, 3).unwrap();
        let midpoint = (1.0 + 0.2) / 2.0;
        assert!(fused.probs.row(0)[0] > midpoint);
        assert_abs_diff_eq!(fused.probs.row(0).iter().sum::<f64>(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn std_dev_rejects_unsupported_top_k() {
        let x = m(vec![vec![0.5, 0.5]]);
        assert!(matches!(
            EnsemblePolicy::StdDev.fuse(&x, &x, 2),
            Err(TptError::UnsupportedTopK { expected: 200, actual: 2 })
        ));
    }

    #[test]
    fn std_dev_adds_scaled_caption() {
        let mut img = vec![0.0; STD_DEV_TOP_K];
        img[0] = 1.0;
        let cap = vec![1.0 / STD_DEV_TOP_K as f64; STD_DEV_TOP_K];
        let fused = EnsemblePolicy::StdDev
            .fuse(&m(vec![img.clone()]), &m(vec![cap.clone()]), STD_DEV_TOP_K)
            .unwrap();
        // A flat caption row has no spread, so it adds (numerically) nothing.
        for (f, e) in fused.probs.row(0).iter().zip(&img) {
            assert_abs_diff_eq!(*f, *e, epsilon = 1e-15);
        }
    }

    #[test]
    fn std_dev_coefficient_follows_relative_spread() {
        let mut img = vec![0.0; STD_DEV_TOP_K];
        img[0] = 1.0;
        // Half the classes at 0.01, half at 0.
        let cap: Vec<f64> = (0..STD_DEV_TOP_K).map(|j| if j < STD_DEV_TOP_K / 2 { 0.01 } else { 0.0 }).collect();

        // Sample variances: image 0.995 / 199 = 0.005, caption 0.005 / 199,
        // so 0.08 * σ_cap / ‖(σ_img, σ_cap)‖ = 0.08 / √200.
        let wb = 0.08 / 200f64.sqrt();

        let fused = EnsemblePolicy::StdDev
            .fuse(&m(vec![img.clone()]), &m(vec![cap.clone()]), STD_DEV_TOP_K)
            .unwrap();
        let row = fused.probs.row(0);
        assert_abs_diff_eq!(row[0], 1.0 + wb * 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(row[1], wb * 0.01, epsilon = 1e-12);
        assert_abs_diff_eq!(row[STD_DEV_TOP_K - 1], 0.0, epsilon = 1e-12);

        let upstream = m(vec![vec![1.0; STD_DEV_TOP_K]]);
        let grad = fused.image_gradient(&m(vec![img]), &m(vec![cap]), &upstream);
        assert!(grad.data[0].iter().all(|&g| g == 1.0));
    }

    #[test]
    fn parses_known_names_and_rejects_others() {
        assert_eq!("harmonic_mean".parse::<EnsemblePolicy>().unwrap(), EnsemblePolicy::HarmonicMean);
        assert_eq!("std_dev".parse::<EnsemblePolicy>().unwrap(), EnsemblePolicy::StdDev);
        assert!(matches!("mean".parse::<EnsemblePolicy>(), Err(TptError::UnknownPolicy(_))));
    }

    #[test]
    fn harmonic_gradient_matches_finite_difference() {
        let image = m(vec![vec![0.6, 0.3, 0.1]]);
        let caption = m(vec![vec![0.2, 0.5, 0.3]]);
        let upstream = m(vec![vec![1.0, -2.0, 0.5]]);
        let fused = EnsemblePolicy::HarmonicMean.fuse(&image, &caption, 3).unwrap();
        let grad = fused.image_gradient(&image, &caption, &upstream);

        let h = 1e-6;
        for j in 0..3 {
            let mut bumped = image.clone();
            bumped.data[0][j] += h;
            let f2 = EnsemblePolicy::HarmonicMean.fuse(&bumped, &caption, 3).unwrap();
            let numeric: f64 = (0..3)
                .map(|k| upstream.data[0][k] * (f2.probs.data[0][k] - fused.probs.data[0][k]) / h)
                .sum();
            assert_abs_diff_eq!(grad.data[0][j], numeric, epsilon = 1e-4);
        }
    }
}
