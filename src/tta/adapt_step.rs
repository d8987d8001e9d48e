use tracing::{debug, info};

use crate::ensemble::caption_bridge::CaptionBridge;
use crate::ensemble::policy::EnsemblePolicy;
use crate::error::Result;
use crate::filter::entropy_filter::filter_on_entropy;
use crate::loss::marginal_entropy::MarginalEntropyLoss;
use crate::math::matrix::Matrix;
use crate::math::stats::{argmax, entropy, top_k};
use crate::model::backbone::Backbone;
use crate::model::captioner::Captioner;
use crate::optim::grad_scaler::GradScaler;
use crate::optim::optimizer::Optimizer;
use crate::tta::run_config::RunConfig;

/// The caption branch of the ICE ensemble: a frozen captioner, the bridge
/// that turns its captions into class distributions, and the fusion policy.
pub struct CaptionEnsemble {
    pub policy: EnsemblePolicy,
    /// Class count the policy is told about; `StdDev` only accepts 200.
    pub top_k: usize,
    bridge: CaptionBridge,
    captioner: Box<dyn Captioner>,
}

impl CaptionEnsemble {
    pub fn new(policy: EnsemblePolicy, top_k: usize, bridge: CaptionBridge, captioner: Box<dyn Captioner>) -> Self {
        CaptionEnsemble { policy, top_k, bridge, captioner }
    }
}

/// What one adaptation step observed before the prompt moved.
#[derive(Debug, Clone)]
pub struct AdaptOutcome {
    /// Marginal entropy of the kept (and possibly fused) distributions.
    pub loss: f64,
    /// Mean of the kept distributions, renormalized to sum to one.
    pub avg_prediction: Vec<f64>,
    pub entropy: f64,
    /// Argmax of `avg_prediction`: the prediction without adaptation.
    pub prediction: usize,
    /// Rows of the batch that passed the confidence filter.
    pub kept: Vec<usize>,
    /// Distribution of each kept view, fused with its caption scores when
    /// the ensemble is on.
    pub probs: Matrix,
    /// False when the gradient scaler found a non-finite gradient and the
    /// optimizer step was skipped.
    pub stepped: bool,
}

/// One test-time tuning step on a batch of views.
///
/// Forward all views, keep the confident ones, optionally fuse them with the
/// caption distributions, then take exactly one optimizer step on the
/// marginal entropy. Only the prompt, the optimizer state and the scaler
/// change. `report` promotes the caption report from debug to info.
pub fn adapt_step(
    views: &[Vec<f64>],
    backbone: &mut dyn Backbone,
    optimizer: &mut dyn Optimizer,
    scaler: Option<&mut GradScaler>,
    ensemble: Option<&mut CaptionEnsemble>,
    config: &RunConfig,
    report: bool,
) -> Result<AdaptOutcome> {
    backbone.set_training(true);
    let forward = backbone.forward(views)?;
    let probs = forward.logits.softmax_rows();
    let filtered = filter_on_entropy(views, &probs, config.percentile, config.preserve_original)?;

    let (loss, grad_kept, distributions) = match ensemble {
        None => {
            // Logits go straight into the loss; its log-softmax is the
            // softmax backward.
            let kept_logits = forward.logits.select_rows(&filtered.kept);
            let loss = MarginalEntropyLoss::loss(&kept_logits);
            let grad = MarginalEntropyLoss::derivative(&kept_logits);
            (loss, grad, filtered.probs)
        }
        Some(ens) => {
            let scores = ens.bridge.class_probabilities(ens.captioner.as_mut(), &filtered.views)?;
            let fusion = ens.policy.fuse(&filtered.probs, &scores.probs, ens.top_k)?;

            let text = caption_report(backbone.class_names(), &scores.captions, &fusion.probs, &scores.probs, &filtered.probs);
            if report {
                info!(policy = %ens.policy, "caption report\n{}", text);
            } else {
                debug!(policy = %ens.policy, "caption report\n{}", text);
            }

            let log_fused = fusion.probs.map(|f| f.max(f64::MIN_POSITIVE).ln());
            let loss = MarginalEntropyLoss::loss(&log_fused);
            let d_log = MarginalEntropyLoss::derivative(&log_fused);
            let mut d_fused = d_log;
            for (g_row, f_row) in d_fused.data.iter_mut().zip(&fusion.probs.data) {
                for (g, &f) in g_row.iter_mut().zip(f_row) {
                    *g = if f > 0.0 { *g / f } else { 0.0 };
                }
            }
            let d_image = fusion.image_gradient(&filtered.probs, &scores.probs, &d_fused);
            (loss, softmax_backward(&filtered.probs, &d_image), fusion.probs)
        }
    };

    // Dropped views contribute nothing.
    let mut grad_logits = Matrix::zeros(forward.logits.rows, forward.logits.cols);
    for (row, &i) in grad_kept.data.into_iter().zip(&filtered.kept) {
        grad_logits.data[i] = row;
    }

    let stepped = match scaler {
        Some(scaler) => {
            for row in grad_logits.data.iter_mut() {
                scaler.scale_in_place(row);
            }
            let mut grads = backbone.backward(&grad_logits)?;
            let finite = scaler.unscale(&mut grads);
            if finite {
                optimizer.step(backbone.parameters_mut(), &grads)?;
            }
            scaler.update(!finite);
            finite
        }
        None => {
            let grads = backbone.backward(&grad_logits)?;
            optimizer.step(backbone.parameters_mut(), &grads)?;
            true
        }
    };

    let mut avg_prediction = distributions.mean_rows();
    let total: f64 = avg_prediction.iter().sum();
    if total > 0.0 {
        avg_prediction.iter_mut().for_each(|p| *p /= total);
    }
    let prediction = argmax(&avg_prediction);

    debug!(loss, kept = filtered.kept.len(), threshold = filtered.threshold, stepped, "adaptation step");

    Ok(AdaptOutcome {
        loss,
        entropy: entropy(&avg_prediction),
        avg_prediction,
        prediction,
        kept: filtered.kept,
        probs: distributions,
        stepped,
    })
}

/// Backprop through a row softmax: `p ⊙ (g - Σ g·p)`.
fn softmax_backward(probs: &Matrix, upstream: &Matrix) -> Matrix {
    let mut grad = Matrix::zeros(probs.rows, probs.cols);
    for (i, (p, g)) in probs.data.iter().zip(&upstream.data).enumerate() {
        let inner: f64 = p.iter().zip(g).map(|(p, g)| p * g).sum();
        for k in 0..probs.cols {
            grad.data[i][k] = p[k] * (g[k] - inner);
        }
    }
    grad
}

/// Caption and top-5 fused / caption / image scores for the first kept view.
fn caption_report(
    class_names: &[String],
    captions: &[String],
    fused: &Matrix,
    caption: &Matrix,
    image: &Matrix,
) -> String {
    let Some(text) = captions.first() else {
        return String::new();
    };
    let name = |c: usize| class_names.get(c).map(String::as_str).unwrap_or("?");
    let mut out = format!("caption: {}\n", text);
    for (label, scores) in [("ice", fused), ("caption", caption), ("image", image)] {
        let row = scores.row(0);
        let top: Vec<String> = top_k(row, 5).into_iter()
            .map(|c| format!("{} {:.3}", name(c), row[c]))
            .collect();
        out.push_str(&format!("{:>8}: {}\n", label, top.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use crate::model::captioner::PrototypeCaptioner;
    use crate::model::prompt_classifier::PromptClassifier;
    use crate::model::text_encoder::HashedTextEncoder;
    use crate::optim::sgd::Sgd;

    const INPUT: usize = 12;

    fn classes() -> Vec<String> {
        ["cat", "dog", "fox", "owl"].iter().map(|s| s.to_string()).collect()
    }

    fn batch(n: usize, seed: u64) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| (0..INPUT).map(|_| rng.gen_range(-1.0..1.0)).collect()).collect()
    }

    fn classifier() -> PromptClassifier {
        PromptClassifier::new(classes(), INPUT, 16, "a photo of a", 3).unwrap()
    }

    #[test]
    fn step_lowers_marginal_entropy_of_the_kept_views() {
        let views = batch(8, 1);
        let mut backbone = classifier();
        let mut optimizer = Sgd::new(1e-4);
        let config = RunConfig { percentile: 100.0, ..RunConfig::default() };

        let outcome = adapt_step(&views, &mut backbone, &mut optimizer, None, None, &config, false).unwrap();
        assert_eq!(outcome.kept, (0..8).collect::<Vec<_>>());
        assert!(outcome.stepped);

        let after = backbone.forward(&views).unwrap().logits;
        assert!(MarginalEntropyLoss::loss(&after) < outcome.loss);
    }

    #[test]
    fn outcome_describes_the_averaged_prediction() {
        let views = batch(10, 2);
        let mut backbone = classifier();
        let before = backbone.parameters().to_vec();
        let mut optimizer = Sgd::new(5e-3);

        let outcome = adapt_step(&views, &mut backbone, &mut optimizer, None, None, &RunConfig::default(), false).unwrap();
        assert_eq!(outcome.prediction, argmax(&outcome.avg_prediction));
        assert!((outcome.avg_prediction.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!(outcome.entropy >= 0.0);
        assert!(!outcome.kept.is_empty() && outcome.kept.len() < 10);
        assert_eq!(outcome.probs.shape(), (outcome.kept.len(), 4));
        assert_ne!(backbone.parameters(), &before[..]);
    }

    #[test]
    fn ensemble_step_fuses_caption_scores() {
        let views = batch(6, 5);
        let mut backbone = classifier();
        let mut optimizer = Sgd::new(1e-3);
        let prototypes = classes().into_iter().zip(batch(4, 9)).collect();
        let captioner = PrototypeCaptioner::new(prototypes, HashedTextEncoder::new(16, 0), 4.0).unwrap();
        let bridge = CaptionBridge::new(backbone.class_names(), "a ");
        let mut ensemble = CaptionEnsemble::new(EnsemblePolicy::HarmonicMean, 4, bridge, Box::new(captioner));
        let mut scaler = GradScaler::new(1000.0);
        let config = RunConfig { percentile: 50.0, preserve_original: true, ..RunConfig::default() };

        let outcome = adapt_step(&views, &mut backbone, &mut optimizer, Some(&mut scaler), Some(&mut ensemble), &config, true)
            .unwrap();
        assert!(outcome.loss.is_finite());
        assert_eq!(outcome.kept[0], 0);
        assert!(outcome.stepped);
    }

    #[test]
    fn std_dev_policy_needs_two_hundred_classes() {
        let views = batch(4, 6);
        let mut backbone = classifier();
        let mut optimizer = Sgd::new(1e-3);
        let captioner = PrototypeCaptioner::new(vec![("cat".into(), vec![1.0; INPUT])], HashedTextEncoder::new(16, 0), 4.0)
            .unwrap();
        let bridge = CaptionBridge::new(backbone.class_names(), "a ");
        let mut ensemble = CaptionEnsemble::new(EnsemblePolicy::StdDev, 4, bridge, Box::new(captioner));

        let result = adapt_step(&views, &mut backbone, &mut optimizer, None, Some(&mut ensemble), &RunConfig::default(), false);
        assert!(matches!(result, Err(crate::error::TptError::UnsupportedTopK { expected: 200, actual: 4 })));
    }

    #[test]
    fn softmax_backward_rows_sum_to_zero() {
        let p = Matrix::from_rows(vec![vec![0.2, 0.3, 0.5]]).unwrap();
        let g = Matrix::from_rows(vec![vec![1.0, -2.0, 0.5]]).unwrap();
        let d = softmax_backward(&p, &g);
        assert!(d.row(0).iter().sum::<f64>().abs() < 1e-12);
    }
}
