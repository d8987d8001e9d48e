use serde::{Serialize, Deserialize};

use crate::stats::average_meter::AverageMeter;

/// What one processed sample contributes to the running statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub label: usize,
    /// Prediction averaged over the filtered views before the optimizer step.
    pub no_adapt_prediction: usize,
    /// Prediction of the adapted prompt on the canonical view.
    pub adapted_prediction: usize,
    /// Whether `label` is among the adapted top-5.
    pub in_top5: bool,
    /// Cross-entropy of the adapted prediction against `label`.
    pub loss: f64,
}

/// Cumulative accuracy and loss for a run, global and per class, with and
/// without adaptation. Owned by the loop and persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub loss: AverageMeter,
    pub top1: AverageMeter,
    pub top5: AverageMeter,
    pub no_adapt_class: Vec<AverageMeter>,
    pub adapt_class: Vec<AverageMeter>,
}

impl RunningStats {
    pub fn new(num_classes: usize) -> Self {
        RunningStats {
            loss: AverageMeter::new(),
            top1: AverageMeter::new(),
            top5: AverageMeter::new(),
            no_adapt_class: vec![AverageMeter::new(); num_classes],
            adapt_class: vec![AverageMeter::new(); num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.adapt_class.len()
    }

    /// Number of samples folded in so far.
    pub fn samples(&self) -> u64 {
        self.top1.count
    }

    /// Folds one sample in. Panics if `obs.label` is out of range.
    pub fn observe(&mut self, obs: &Observation) {
        let hit = obs.adapted_prediction == obs.label;
        self.loss.update(obs.loss);
        self.top1.record(hit);
        self.top5.record(obs.in_top5);
        self.no_adapt_class[obs.label].record(obs.no_adapt_prediction == obs.label);
        self.adapt_class[obs.label].record(hit);
    }

    /// Per-class percentage accuracies `(without, with)` adaptation; `-1`
    /// marks classes with no observations.
    pub fn class_accuracies(&self) -> (Vec<f64>, Vec<f64>) {
        (
            self.no_adapt_class.iter().map(AverageMeter::get_avg).collect(),
            self.adapt_class.iter().map(AverageMeter::get_avg).collect(),
        )
    }

    /// Aggregate no-adaptation top-1 across all classes, percentage scale.
    pub fn no_adapt_top1(&self) -> f64 {
        let mut total = AverageMeter::new();
        for m in &self.no_adapt_class {
            if m.count > 0 {
                total.update_n(m.sum / m.count as f64, m.count);
            }
        }
        total.get_avg()
    }
}
