use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use approx::assert_abs_diff_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use ferrite_tpt::data::sample::Sample;
use ferrite_tpt::ensemble::policy::EnsemblePolicy;
use ferrite_tpt::math::stats::entropy;
use ferrite_tpt::model::text_encoder::HashedTextEncoder;
use ferrite_tpt::optim::adamw::AdamWConfig;
use ferrite_tpt::tta::sample_stats::SampleStats;
use ferrite_tpt::{
    filter_on_entropy, AdamW, AdaptationLoop, Backbone, CaptionBridge, CaptionEnsemble, Checkpoint,
    MarginalEntropyLoss, Matrix, PromptClassifier, PrototypeCaptioner, RunConfig, TestStream, VecStream,
};

const INPUT: usize = 6;
const CLASSES: [&str; 5] = ["apple", "bicycle", "castle", "dolphin", "eagle"];

fn class_names() -> Vec<String> {
    CLASSES.iter().map(|s| s.to_string()).collect()
}

fn samples(n: usize, views: usize, seed: u64) -> Vec<(Vec<Vec<f64>>, usize)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let views = (0..views)
                .map(|_| (0..INPUT).map(|_| rng.gen_range(-1.0..1.0)).collect())
                .collect();
            (views, i % CLASSES.len())
        })
        .collect()
}

fn config(runs_dir: &Path, run_name: &str, log_frequency: usize) -> RunConfig {
    RunConfig {
        run_name: run_name.into(),
        runs_dir: runs_dir.to_path_buf(),
        views: 8,
        log_frequency,
        ..RunConfig::default()
    }
}

fn tta(config: RunConfig) -> AdaptationLoop<PromptClassifier> {
    let backbone = PromptClassifier::new(class_names(), INPUT, 16, "a photo of a", 42).unwrap();
    AdaptationLoop::new(backbone, Box::new(AdamW::new(5e-3, AdamWConfig::default())), config).unwrap()
}

/// Raises the stop flag while handing out the `budget`-th sample, as a
/// Ctrl-C during that sample would.
struct StopAfter {
    inner: VecStream,
    flag: Arc<AtomicBool>,
    budget: usize,
}

impl TestStream for StopAfter {
    fn len(&self) -> usize {
        self.inner.len()
    }

    fn skip_to(&mut self, index: usize) {
        self.inner.skip_to(index)
    }

    fn next_sample(&mut self) -> ferrite_tpt::Result<Option<Sample>> {
        let sample = self.inner.next_sample()?;
        self.budget = self.budget.saturating_sub(1);
        if self.budget == 0 {
            self.flag.store(true, Ordering::Relaxed);
        }
        Ok(sample)
    }
}

#[test]
fn every_sample_starts_from_the_same_prompt_and_optimizer_state() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel::<SampleStats>();
    let mut cfg = config(dir.path(), "reset", 100);
    cfg.progress_tx = Some(tx);

    let mut tta = tta(cfg);
    let initial_prompt = tta.backbone().parameters().to_vec();
    let initial_state = tta.optimizer_state();

    // The same sample three times in a row must be scored identically.
    let one = samples(1, 8, 3).remove(0);
    let mut stream = VecStream::new(vec![one.clone(), one.clone(), one]);
    tta.run(&mut stream, None).unwrap();

    let progress: Vec<SampleStats> = rx.try_iter().collect();
    assert_eq!(progress.len(), 3);
    for p in &progress[1..] {
        assert_eq!(p.adapt_loss, progress[0].adapt_loss);
        assert_eq!(p.eval_loss, progress[0].eval_loss);
        assert_eq!(p.prediction, progress[0].prediction);
    }

    assert_ne!(tta.backbone().parameters(), &initial_prompt[..]);
    tta.reset().unwrap();
    assert_eq!(tta.backbone().parameters(), &initial_prompt[..]);
    assert_eq!(tta.optimizer_state(), initial_state);
}

#[test]
fn interrupted_run_resumed_from_checkpoint_matches_uninterrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let data = samples(9, 8, 11);

    let full = tta(config(dir.path(), "full", 4))
        .run(&mut VecStream::new(data.clone()), None)
        .unwrap();
    assert_eq!(full.last_index, Some(8));
    assert_eq!(full.stats.samples(), 9);

    // First half: stop after five samples.
    let flag = Arc::new(AtomicBool::new(false));
    let mut cfg = config(dir.path(), "resumed", 4);
    cfg.stop_flag = Some(Arc::clone(&flag));
    let mut stream = StopAfter { inner: VecStream::new(data.clone()), flag, budget: 5 };
    let first = tta(cfg).run(&mut stream, None).unwrap();
    assert!(first.interrupted);
    assert_eq!(first.samples_seen, 5);
    assert_eq!(first.last_index, Some(4));

    // Second half: a fresh process picks up the newest checkpoint.
    let run_dir = dir.path().join("resumed");
    let checkpoint = Checkpoint::latest_in(&run_dir).unwrap().unwrap();
    assert_eq!(checkpoint.last_index, 4);
    let second = tta(config(dir.path(), "resumed", 4))
        .run(&mut VecStream::new(data), Some(checkpoint))
        .unwrap();

    assert!(!second.interrupted);
    assert_eq!(second.samples_seen, 4);
    assert_eq!(second.last_index, Some(8));
    // Hit counts are exact; the loss sum went through JSON.
    assert_eq!(second.stats.top1, full.stats.top1);
    assert_eq!(second.stats.top5, full.stats.top5);
    assert_eq!(second.stats.no_adapt_class, full.stats.no_adapt_class);
    assert_eq!(second.stats.adapt_class, full.stats.adapt_class);
    assert_eq!(second.stats.loss.count, full.stats.loss.count);
    assert_abs_diff_eq!(second.stats.loss.sum, full.stats.loss.sum, epsilon = 1e-9);
}

#[test]
fn stop_flag_still_writes_the_final_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let flag = Arc::new(AtomicBool::new(false));
    let mut cfg = config(dir.path(), "stopped", 100);
    cfg.stop_flag = Some(Arc::clone(&flag));

    let mut stream = StopAfter { inner: VecStream::new(samples(6, 8, 5)), flag, budget: 2 };
    let outcome = tta(cfg).run(&mut stream, None).unwrap();

    assert!(outcome.interrupted);
    assert_eq!(outcome.last_index, Some(1));
    assert_eq!(outcome.stats.samples(), 2);
    let run_dir = dir.path().join("stopped");
    assert!(run_dir.join("checkpoint_0.json").exists());
    assert!(run_dir.join("checkpoint_1.json").exists());
    assert!(run_dir.join("accuracy_by_class.svg").exists());
}

#[test]
fn flag_raised_before_start_processes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "early", 100);
    cfg.stop_flag = Some(Arc::new(AtomicBool::new(true)));

    let outcome = tta(cfg).run(&mut VecStream::new(samples(3, 8, 1)), None).unwrap();
    assert!(outcome.interrupted);
    assert_eq!(outcome.samples_seen, 0);
    assert_eq!(outcome.last_index, None);
    assert_eq!(outcome.stats.top1.get_avg(), -1.0);
}

#[test]
fn dropped_progress_receiver_stops_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = mpsc::channel::<SampleStats>();
    drop(rx);
    let mut cfg = config(dir.path(), "dropped", 100);
    cfg.progress_tx = Some(tx);

    let outcome = tta(cfg).run(&mut VecStream::new(samples(4, 8, 2)), None).unwrap();
    assert!(outcome.interrupted);
    assert_eq!(outcome.samples_seen, 1);
}

#[test]
fn five_class_four_view_filter_keeps_confident_views_and_lowers_loss() {
    let flat = vec![0.2; 5];
    let sharp = vec![0.96, 0.01, 0.01, 0.01, 0.01];
    let probs = Matrix::from_rows(vec![flat, sharp.clone(), sharp.clone(), sharp]).unwrap();
    let views: Vec<Vec<f64>> = (0..4).map(|i| vec![i as f64; INPUT]).collect();

    let filtered = filter_on_entropy(&views, &probs, 10.0, false).unwrap();
    assert_eq!(filtered.kept, vec![1, 2, 3]);
    assert!(filtered.probs.data.iter().all(|row| entropy(row) <= filtered.threshold));
    assert_eq!(filtered.views[0], views[1]);

    let log_all = probs.map(f64::ln);
    let log_kept = filtered.probs.map(f64::ln);
    assert!(MarginalEntropyLoss::loss(&log_kept) < MarginalEntropyLoss::loss(&log_all));
    assert_abs_diff_eq!(MarginalEntropyLoss::loss(&log_kept), entropy(&filtered.probs.mean_rows()), epsilon = 1e-5);

    let preserved = filter_on_entropy(&views, &probs, 10.0, true).unwrap();
    assert_eq!(preserved.kept, vec![0, 1, 2, 3]);
}

#[test]
fn ensemble_run_tracks_stats_for_every_sample() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path(), "ice", 2);
    cfg.ensemble = true;
    cfg.ensemble_policy = EnsemblePolicy::Entropy;
    cfg.preserve_original = true;

    let mut tta = tta(cfg);
    let prototypes = class_names().into_iter().zip(samples(5, 1, 77).into_iter().map(|(v, _)| v[0].clone())).collect();
    let captioner = PrototypeCaptioner::new(prototypes, HashedTextEncoder::new(16, 0), 100f64.ln()).unwrap();
    let bridge = CaptionBridge::new(tta.backbone().class_names(), "a ");
    tta = tta.with_ensemble(CaptionEnsemble::new(EnsemblePolicy::Entropy, CLASSES.len(), bridge, Box::new(captioner)));

    let outcome = tta.run(&mut VecStream::new(samples(5, 8, 8)), None).unwrap();
    assert_eq!(outcome.stats.samples(), 5);
    assert!(outcome.stats.loss.mean().unwrap().is_finite());
    let (no_adapt, adapt) = outcome.stats.class_accuracies();
    assert!(no_adapt.iter().chain(&adapt).all(|&a| a == 100.0 || a == 0.0));
    assert!(dir.path().join("ice").join("checkpoint_4.json").exists());
}
