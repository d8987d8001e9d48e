use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::error::{Result, TptError};
use crate::stats::running_stats::RunningStats;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Resumable loop state: the last fully processed sample index and the
/// statistics accumulated up to and including it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub last_index: usize,
    pub stats: RunningStats,
}

impl Checkpoint {
    pub fn new(last_index: usize, stats: RunningStats) -> Self {
        Checkpoint { version: CHECKPOINT_VERSION, last_index, stats }
    }

    /// `checkpoint_{index}.json`
    pub fn file_name(index: usize) -> String {
        format!("checkpoint_{}.json", index)
    }

    /// Writes `dir/checkpoint_{last_index}.json` and returns its path.
    ///
    /// The JSON goes to a `.tmp` sibling first and is renamed into place once
    /// it is fully on disk, so a crash never leaves a truncated checkpoint
    /// under the final name.
    pub fn save_in(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(self.last_index));
        let tmp = path.with_extension("json.tmp");

        let mut writer = std::io::BufWriter::new(std::fs::File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);
        std::fs::rename(&tmp, &path)?;

        debug!(path = %path.display(), "checkpoint written");
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Checkpoint> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        let checkpoint: Checkpoint = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| TptError::Checkpoint { path: path.to_path_buf(), reason: e.to_string() })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(TptError::Checkpoint {
                path: path.to_path_buf(),
                reason: format!("unsupported version {}", checkpoint.version),
            });
        }
        Ok(checkpoint)
    }

    /// Loads the checkpoint with the largest index in `dir`, if any. A missing
    /// directory means a fresh run.
    ///
    /// Unreadable checkpoints are skipped with a warning in favour of the
    /// next-highest one; only when none of them load is the newest error
    /// returned.
    pub fn latest_in(dir: impl AsRef<Path>) -> Result<Option<Checkpoint>> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Ok(None);
        }
        let mut candidates: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                parse_index(&name).map(|i| (i, e.path()))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut first_error = None;
        for (index, path) in candidates {
            match Checkpoint::load(&path) {
                Ok(checkpoint) => {
                    info!(index, path = %path.display(), "resuming from checkpoint");
                    return Ok(Some(checkpoint));
                }
                Err(e) => {
                    warn!(index, error = %e, "skipping unreadable checkpoint");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }
}

fn parse_index(file_name: &str) -> Option<usize> {
    file_name
        .strip_prefix("checkpoint_")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
