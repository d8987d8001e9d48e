use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::{Arc, atomic::AtomicBool};

use serde::{Serialize, Deserialize};

use crate::data::dataset::DatasetKind;
use crate::ensemble::caption_bridge::DEFAULT_CAPTION_PREFIX;
use crate::ensemble::policy::EnsemblePolicy;
use crate::error::{Result, TptError};
use crate::filter::entropy_filter::DEFAULT_PERCENTILE;
use crate::optim::adamw::{AdamW, AdamWConfig};
use crate::optim::optimizer::Optimizer;
use crate::optim::sgd::Sgd;
use crate::tta::sample_stats::SampleStats;

/// Which optimizer adapts the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    AdamW,
    Sgd,
}

impl OptimizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::AdamW => "adamw",
            OptimizerKind::Sgd => "sgd",
        }
    }

    /// Fresh optimizer of this kind. SGD runs with momentum 0.9.
    pub fn build(&self, learning_rate: f64) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::AdamW => Box::new(AdamW::new(learning_rate, AdamWConfig::default())),
            OptimizerKind::Sgd => Box::new(Sgd::new(learning_rate).with_momentum(0.9)),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = TptError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adamw" => Ok(OptimizerKind::AdamW),
            "sgd" => Ok(OptimizerKind::Sgd),
            other => Err(TptError::Config(format!("unknown optimizer '{}'", other))),
        }
    }
}

/// Everything a test-time adaptation run needs, threaded explicitly into the
/// loop.
///
/// # Fields
/// - `run_name`      — output directory name under `runs_dir`
/// - `views`         — batch size per sample, canonical image included
/// - `percentile`    — confidence filter percentile in `[0, 100]`
/// - `top_k`         — class count handed to the ensemble policy; defaults to
///                     the backbone's class count
/// - `log_frequency` — report + checkpoint every this many sample indices
/// - `progress_tx`   — optional channel; one `SampleStats` per sample. If the
///                     receiver is dropped the loop stops.
/// - `stop_flag`     — optional atomic flag checked between samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub run_name: String,
    pub runs_dir: PathBuf,
    pub dataset: DatasetKind,
    pub data_root: Option<PathBuf>,
    pub backbone: String,
    pub ctx_init: String,
    pub image_size: usize,
    pub embed_dim: usize,
    pub views: usize,
    pub percentile: f64,
    pub preserve_original: bool,
    pub ensemble: bool,
    pub ensemble_policy: EnsemblePolicy,
    pub top_k: Option<usize>,
    pub caption_prefix: String,
    /// Image folder whose class directories name the captioner's phrases.
    pub caption_root: Option<PathBuf>,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    pub grad_scaling: bool,
    pub log_frequency: usize,
    pub debug: bool,
    pub seed: u64,
    #[serde(skip)]
    pub progress_tx: Option<mpsc::Sender<SampleStats>>,
    #[serde(skip)]
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            run_name: "tpt".into(),
            runs_dir: PathBuf::from("runs"),
            dataset: DatasetKind::default(),
            data_root: None,
            backbone: "ViT-B/16".into(),
            ctx_init: "a photo of a".into(),
            image_size: 32,
            embed_dim: 512,
            views: 64,
            percentile: DEFAULT_PERCENTILE,
            preserve_original: false,
            ensemble: false,
            ensemble_policy: EnsemblePolicy::default(),
            top_k: None,
            caption_prefix: DEFAULT_CAPTION_PREFIX.into(),
            caption_root: None,
            learning_rate: 5e-3,
            optimizer: OptimizerKind::default(),
            grad_scaling: false,
            log_frequency: 100,
            debug: false,
            seed: 0,
            progress_tx: None,
            stop_flag: None,
        }
    }
}

impl RunConfig {
    /// `runs_dir/run_name`: checkpoints, charts, metrics and the log land here.
    pub fn run_dir(&self) -> PathBuf {
        self.runs_dir.join(&self.run_name)
    }

    /// Policy the loop fuses with, or `None` when the ensemble is off.
    pub fn active_policy(&self) -> Option<EnsemblePolicy> {
        self.ensemble.then_some(self.ensemble_policy)
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_name.trim().is_empty() {
            return Err(TptError::Config("run name must not be empty".into()));
        }
        if !(0.0..=100.0).contains(&self.percentile) {
            return Err(TptError::Config(format!(
                "confidence percentile must be in [0, 100], got {}",
                self.percentile
            )));
        }
        if self.views == 0 {
            return Err(TptError::Config("views must be at least 1".into()));
        }
        if self.log_frequency == 0 {
            return Err(TptError::Config("log frequency must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TptError::Config(format!("invalid learning rate {}", self.learning_rate)));
        }
        if self.image_size == 0 || self.embed_dim == 0 {
            return Err(TptError::Config("image size and embedding size must be positive".into()));
        }
        Ok(())
    }

    /// Serializes the config to a pretty-printed JSON file.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    /// Deserializes a config from a JSON file; missing fields take defaults.
    pub fn load_json(path: impl AsRef<Path>) -> Result<RunConfig> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}
