use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::data::sample::{Sample, TestStream};
use crate::error::{Result, TptError};
use crate::loss::cross_entropy::CrossEntropyLoss;
use crate::math::matrix::softmax;
use crate::math::stats::{argmax, entropy, top_k};
use crate::model::backbone::Backbone;
use crate::optim::grad_scaler::GradScaler;
use crate::optim::optimizer::{Optimizer, OptimizerState};
use crate::stats::running_stats::{Observation, RunningStats};
use crate::tta::adapt_step::{adapt_step, CaptionEnsemble};
use crate::tta::checkpoint::Checkpoint;
use crate::tta::report::{batch_report, class_accuracy_svg, prediction_report, write_chart, ClassFilter, MetricsWriter};
use crate::tta::run_config::RunConfig;
use crate::tta::sample_stats::SampleStats;

/// How a run ended.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub stats: RunningStats,
    /// Last fully processed index, including one restored from a checkpoint.
    pub last_index: Option<usize>,
    /// Stopped by the stop flag or a dropped progress receiver.
    pub interrupted: bool,
    /// Samples processed by this call (resumed ones not counted).
    pub samples_seen: usize,
}

/// Per-sample test-time prompt tuning over a stream.
///
/// For every sample: reset the prompt and optimizer, take one adaptation
/// step on the augmented views, re-infer the canonical view with the adapted
/// prompt and fold the result into the running statistics. Every
/// `log_frequency` indices the stats are logged, charted and checkpointed.
pub struct AdaptationLoop<B: Backbone> {
    backbone: B,
    optimizer: Box<dyn Optimizer>,
    initial_state: OptimizerState,
    scaler: Option<GradScaler>,
    ensemble: Option<CaptionEnsemble>,
    config: RunConfig,
    metrics: MetricsWriter,
}

impl<B: Backbone> AdaptationLoop<B> {
    /// Validates `config`, creates the run directory and snapshots the
    /// optimizer state every sample starts from.
    pub fn new(backbone: B, optimizer: Box<dyn Optimizer>, config: RunConfig) -> Result<Self> {
        config.validate()?;
        let run_dir = config.run_dir();
        std::fs::create_dir_all(&run_dir)?;
        if config.debug {
            std::fs::create_dir_all(run_dir.join("predictions"))?;
        }

        let metrics = MetricsWriter::open(run_dir.join("metrics.jsonl"))?;
        let initial_state = optimizer.state();
        let scaler = config.grad_scaling.then(GradScaler::default);
        info!(
            run_dir = %run_dir.display(),
            learning_rate = optimizer.learning_rate(),
            percentile = config.percentile,
            ensemble = ?config.active_policy(),
            grad_scaling = scaler.is_some(),
            "adaptation loop ready"
        );

        Ok(AdaptationLoop { backbone, optimizer, initial_state, scaler, ensemble: None, config, metrics })
    }

    pub fn with_ensemble(mut self, ensemble: CaptionEnsemble) -> Self {
        self.ensemble = Some(ensemble);
        self
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn optimizer_state(&self) -> OptimizerState {
        self.optimizer.state()
    }

    /// Restores the prompt and the optimizer to their starting point.
    pub fn reset(&mut self) -> Result<()> {
        self.backbone.reset();
        self.optimizer.load_state(&self.initial_state)
    }

    /// Runs the stream to the end, the stop flag, or a dropped progress
    /// receiver, whichever comes first.
    ///
    /// With a checkpoint, its stats are restored and the stream resumes at
    /// `last_index + 1`. The last processed index is always flushed, never
    /// twice.
    pub fn run(&mut self, stream: &mut dyn TestStream, checkpoint: Option<Checkpoint>) -> Result<LoopOutcome> {
        let num_classes = self.backbone.num_classes();
        let (mut stats, mut last_index) = match checkpoint {
            Some(cp) => {
                if cp.stats.num_classes() != num_classes {
                    return Err(TptError::Checkpoint {
                        path: self.config.run_dir(),
                        reason: format!(
                            "checkpoint tracks {} classes, backbone has {}",
                            cp.stats.num_classes(),
                            num_classes
                        ),
                    });
                }
                info!(last_index = cp.last_index, samples = cp.stats.samples(), "restored running stats");
                (cp.stats, Some(cp.last_index))
            }
            None => (RunningStats::new(num_classes), None),
        };
        let mut last_flushed = last_index;
        stream.skip_to(last_index.map_or(0, |i| i + 1));

        let mut interrupted = false;
        let mut samples_seen = 0;

        loop {
            if let Some(ref flag) = self.config.stop_flag {
                if flag.load(Ordering::Relaxed) {
                    warn!(last_index, "interrupted, flushing");
                    interrupted = true;
                    break;
                }
            }

            let Some(sample) = stream.next_sample()? else {
                break;
            };
            let t_start = Instant::now();

            let progress = self.process(&sample, &mut stats, stream.len())?;
            samples_seen += 1;
            last_index = Some(sample.index);

            if sample.index % self.config.log_frequency == 0 {
                self.flush(&stats, sample.index)?;
                last_flushed = Some(sample.index);
            }

            let progress = SampleStats { elapsed_ms: t_start.elapsed().as_millis() as u64, ..progress };
            if let Some(ref tx) = self.config.progress_tx {
                // If the receiver has been dropped, stop.
                if tx.send(progress).is_err() {
                    warn!("progress receiver dropped, stopping");
                    interrupted = true;
                    break;
                }
            }
        }

        if let Some(index) = last_index {
            if last_flushed != Some(index) {
                self.flush(&stats, index)?;
            }
        }

        let run_dir = self.config.run_dir();
        let names = self.backbone.class_names();
        write_chart(run_dir.join("accuracy_by_class.svg"), &class_accuracy_svg(&stats, names, ClassFilter::All))?;
        write_chart(
            run_dir.join("accuracy_by_worst_class.svg"),
            &class_accuracy_svg(&stats, names, ClassFilter::Worse),
        )?;
        self.metrics.flush()?;

        info!(
            samples_seen,
            interrupted,
            top1 = stats.top1.get_avg(),
            top5 = stats.top5.get_avg(),
            no_adapt_top1 = stats.no_adapt_top1(),
            "adaptation finished"
        );

        Ok(LoopOutcome { stats, last_index, interrupted, samples_seen })
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    /// RESET → ADAPT → RE-INFER → UPDATE_STATS for one sample.
    fn process(&mut self, sample: &Sample, stats: &mut RunningStats, total: usize) -> Result<SampleStats> {
        let num_classes = self.backbone.num_classes();
        if sample.label >= num_classes {
            return Err(TptError::Config(format!(
                "sample {} has label {} but the backbone knows {} classes",
                sample.index, sample.label, num_classes
            )));
        }
        if sample.views.is_empty() {
            return Err(TptError::Config(format!("sample {} has no views", sample.index)));
        }

        self.reset()?;

        let report = sample.index % self.config.log_frequency == 0;
        let outcome = adapt_step(
            &sample.views,
            &mut self.backbone,
            self.optimizer.as_mut(),
            self.scaler.as_mut(),
            self.ensemble.as_mut(),
            &self.config,
            report,
        )?;

        // Re-infer the canonical view with the adapted prompt.
        self.backbone.set_training(false);
        let forward = self.backbone.forward(&sample.views[..1]);
        self.backbone.set_training(true);
        let logits = forward?.logits;
        let logits = logits.row(0);

        let probs = softmax(logits);
        let prediction = argmax(&probs);
        let eval_loss = CrossEntropyLoss::loss(logits, sample.label);
        let adapted_entropy = entropy(&probs);

        stats.observe(&Observation {
            label: sample.label,
            no_adapt_prediction: outcome.prediction,
            adapted_prediction: prediction,
            in_top5: top_k(&probs, 5).contains(&sample.label),
            loss: eval_loss,
        });

        let step = sample.index;
        self.metrics.add_scalar("delta_loss", outcome.loss - eval_loss, step)?;
        self.metrics.add_scalar("delta_entropy", adapted_entropy - outcome.entropy, step)?;
        self.metrics.add_scalar("top1", stats.top1.get_avg(), step)?;
        self.metrics.add_scalar("top5", stats.top5.get_avg(), step)?;

        if self.config.debug {
            let names = self.backbone.class_names();
            let batch = batch_report(sample.index, sample.label, &outcome.kept, &outcome.probs, names);
            std::fs::write(self.prediction_path(&format!("batch_{}.txt", sample.index)), batch)?;
            let text = prediction_report(sample.index, sample.label, &probs, names);
            std::fs::write(self.prediction_path(&format!("sample_{}.txt", sample.index)), text)?;
        }

        debug!(
            index = sample.index,
            label = sample.label,
            no_adapt = outcome.prediction,
            adapted = prediction,
            kept = outcome.kept.len(),
            "sample done"
        );

        Ok(SampleStats {
            index: sample.index,
            total,
            label: sample.label,
            prediction,
            adapt_loss: outcome.loss,
            eval_loss,
            top1: stats.top1.get_avg(),
            top5: stats.top5.get_avg(),
            kept_views: outcome.kept.len(),
            elapsed_ms: 0,
        })
    }

    /// Logs, charts and checkpoints the stats as of `index`.
    fn flush(&mut self, stats: &RunningStats, index: usize) -> Result<()> {
        info!(
            index,
            samples = stats.samples(),
            top1 = stats.top1.get_avg(),
            top5 = stats.top5.get_avg(),
            no_adapt_top1 = stats.no_adapt_top1(),
            loss = stats.loss.mean().unwrap_or(f64::NAN),
            "progress"
        );
        let run_dir = self.config.run_dir();
        let svg = class_accuracy_svg(stats, self.backbone.class_names(), ClassFilter::All);
        write_chart(run_dir.join(format!("class_accuracy_{}.svg", index)), &svg)?;
        Checkpoint::new(index, stats.clone()).save_in(&run_dir)?;
        self.metrics.flush()
    }

    fn prediction_path(&self, file_name: &str) -> PathBuf {
        self.config.run_dir().join("predictions").join(file_name)
    }
}
