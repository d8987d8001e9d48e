use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use clap::Parser;
use tracing::{error, info, warn};

use ferrite_tpt::data::augment::ImageShape;
use ferrite_tpt::data::dataset::DatasetKind;
use ferrite_tpt::data::image_folder::{clip_normalize, AugmentedStream, ImageFolder};
use ferrite_tpt::ensemble::caption_bridge::CaptionBridge;
use ferrite_tpt::ensemble::policy::EnsemblePolicy;
use ferrite_tpt::logging::init_tracing;
use ferrite_tpt::model::backbone::Backbone;
use ferrite_tpt::model::captioner::PrototypeCaptioner;
use ferrite_tpt::model::device::Device;
use ferrite_tpt::model::prompt_classifier::PromptClassifier;
use ferrite_tpt::model::text_encoder::HashedTextEncoder;
use ferrite_tpt::tta::adapt_loop::AdaptationLoop;
use ferrite_tpt::tta::adapt_step::CaptionEnsemble;
use ferrite_tpt::tta::checkpoint::Checkpoint;
use ferrite_tpt::tta::report::RunSummary;
use ferrite_tpt::tta::run_config::{OptimizerKind, RunConfig};
use ferrite_tpt::tta::sample_stats::log_progress;
use ferrite_tpt::Result;

/// Samples between two progress lines on the console.
const PROGRESS_EVERY: usize = 10;

/// Test-time prompt tuning over an image-folder benchmark.
#[derive(Debug, Parser)]
#[command(name = "ferrite-tpt", version)]
struct Cli {
    /// JSON run config; flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    run_name: Option<String>,

    #[arg(long)]
    runs_dir: Option<PathBuf>,

    /// Fuse image and caption predictions.
    #[arg(long)]
    ensemble: bool,

    /// entropy | std_dev | harmonic_mean
    #[arg(long)]
    ensemble_method: Option<EnsemblePolicy>,

    /// Image folder of caption prototypes (one directory per phrase).
    #[arg(long)]
    caption_root: Option<PathBuf>,

    #[arg(long)]
    debug: bool,

    #[arg(long)]
    backbone: Option<String>,

    /// imagenet_v2 | imagenet_a
    #[arg(long)]
    dataset: Option<DatasetKind>,

    /// Directory holding one sub-directory per class. Defaults to
    /// `data/<dataset>`.
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Views per sample, canonical image included.
    #[arg(long)]
    views: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    learning_rate: Option<f64>,

    /// adamw | sgd
    #[arg(long)]
    optimizer: Option<OptimizerKind>,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load_json(path)?,
            None => RunConfig::default(),
        };
        if let Some(v) = self.run_name { config.run_name = v; }
        if let Some(v) = self.runs_dir { config.runs_dir = v; }
        if let Some(v) = self.ensemble_method { config.ensemble_policy = v; }
        if let Some(v) = self.caption_root { config.caption_root = Some(v); }
        if let Some(v) = self.backbone { config.backbone = v; }
        if let Some(v) = self.dataset { config.dataset = v; }
        if let Some(v) = self.data_root { config.data_root = Some(v); }
        if let Some(v) = self.views { config.views = v; }
        if let Some(v) = self.seed { config.seed = v; }
        if let Some(v) = self.learning_rate { config.learning_rate = v; }
        if let Some(v) = self.optimizer { config.optimizer = v; }
        config.ensemble |= self.ensemble;
        config.debug |= self.debug;
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_tracing(Some(&config.run_dir().join("log.log")), config.debug) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(mut config: RunConfig) -> Result<()> {
    let device = Device::select();
    config.grad_scaling |= device.wants_grad_scaling();
    info!(?device, run = %config.run_name, backbone = %config.backbone, dataset = %config.dataset, "starting");

    let shape = ImageShape { width: config.image_size, height: config.image_size };
    let data_root = config.data_root.clone()
        .unwrap_or_else(|| Path::new("data").join(config.dataset.as_str()));
    let folder = ImageFolder::open(&data_root, shape)?;
    if folder.class_names().len() != config.dataset.expected_classes() {
        warn!(
            found = folder.class_names().len(),
            expected = config.dataset.expected_classes(),
            "class count differs from the benchmark"
        );
    }

    let backbone = PromptClassifier::new(
        folder.class_names().to_vec(),
        shape.len(),
        config.embed_dim,
        &config.ctx_init,
        config.seed,
    )?;
    let num_classes = backbone.num_classes();

    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&stop_flag);
        ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
            .map_err(|e| ferrite_tpt::TptError::Config(format!("cannot install Ctrl-C handler: {}", e)))?;
    }
    config.stop_flag = Some(stop_flag);

    let ensemble = match config.active_policy() {
        Some(policy) => {
            let root = config.caption_root.clone().ok_or_else(|| {
                ferrite_tpt::TptError::Config("the caption ensemble needs --caption-root".into())
            })?;
            let captioner = prototype_captioner(&root, shape, config.embed_dim, config.seed)?;
            let bridge = CaptionBridge::new(backbone.class_names(), config.caption_prefix.clone());
            let top_k = config.top_k.unwrap_or(num_classes);
            Some(CaptionEnsemble::new(policy, top_k, bridge, Box::new(captioner)))
        }
        None => None,
    };

    let checkpoint = Checkpoint::latest_in(config.run_dir())?;
    let optimizer = config.optimizer.build(config.learning_rate);
    let mut stream = AugmentedStream::new(folder, config.views, config.seed);

    let (tx, rx) = mpsc::channel();
    let progress = thread::spawn(move || log_progress(rx, PROGRESS_EVERY));
    let mut loop_config = config.clone();
    loop_config.progress_tx = Some(tx);

    let mut tta = AdaptationLoop::new(backbone, optimizer, loop_config)?;
    if let Some(ensemble) = ensemble {
        tta = tta.with_ensemble(ensemble);
    }
    let outcome = tta.run(&mut stream, checkpoint);
    // Dropping the loop closes the channel and ends the progress thread.
    drop(tta);
    if progress.join().is_err() {
        warn!("progress logger panicked");
    }
    let outcome = outcome?;

    let summary = RunSummary {
        dataset: config.dataset,
        backbone: config.backbone.clone(),
        ensemble_enabled: config.ensemble,
        top1: outcome.stats.top1.get_avg(),
        run_name: config.run_name.clone(),
        ensemble_policy: config.active_policy(),
    };
    summary.save_json(config.run_dir().join("final_result.json"))?;
    info!(
        top1 = summary.top1,
        no_adapt_top1 = outcome.stats.no_adapt_top1(),
        interrupted = outcome.interrupted,
        "run summary written"
    );
    Ok(())
}

/// Every image under `root/<phrase>/` becomes a prototype for `<phrase>`.
fn prototype_captioner(root: &Path, shape: ImageShape, embed_dim: usize, seed: u64) -> Result<PrototypeCaptioner> {
    let folder = ImageFolder::open(root, shape)?;
    let mut prototypes = Vec::with_capacity(folder.len());
    for i in 0..folder.len() {
        let (mut pixels, label) = folder.load(i)?;
        clip_normalize(&mut pixels);
        prototypes.push((folder.class_names()[label].clone(), pixels));
    }
    PrototypeCaptioner::new(prototypes, HashedTextEncoder::new(embed_dim, seed), 100f64.ln())
}
