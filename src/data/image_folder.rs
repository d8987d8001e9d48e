//! Image-folder datasets: `root/<class_dir>/<image files>`.
//!
//! Images are decoded lazily with the `image` crate, resized (bicubic) to a
//! fixed size, and flattened as R, G, B, ... in `[0, 1]`, the same layout
//! the augmenter works on.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::data::augment::{AugMix, ImageShape};
use crate::data::sample::{Sample, TestStream};
use crate::error::{Result, TptError};

/// CLIP's per-channel normalisation constants.
pub const CLIP_MEAN: [f64; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_STD: [f64; 3] = [0.26862954, 0.26130258, 0.27577711];

const EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub shape: ImageShape,
    class_names: Vec<String>,
    items: Vec<(PathBuf, usize)>,
}

impl ImageFolder {
    /// Scans `root`. Class directories are sorted by name; underscores in
    /// directory names become spaces in class names.
    pub fn open(root: impl AsRef<Path>, shape: ImageShape) -> Result<Self> {
        let root = root.as_ref();
        let mut class_dirs: Vec<PathBuf> = std::fs::read_dir(root)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        class_dirs.sort();

        if class_dirs.is_empty() {
            return Err(TptError::Config(format!("no class directories under {}", root.display())));
        }

        let mut class_names = Vec::with_capacity(class_dirs.len());
        let mut items = Vec::new();
        for (label, dir) in class_dirs.iter().enumerate() {
            let name = dir.file_name().map(|n| n.to_string_lossy().replace('_', " ")).unwrap_or_default();
            class_names.push(name);

            let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| has_image_extension(p))
                .collect();
            files.sort();
            items.extend(files.into_iter().map(|f| (f, label)));
        }

        info!(root = %root.display(), classes = class_names.len(), images = items.len(), "opened image folder");
        Ok(ImageFolder { shape, class_names, items })
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Decodes item `i` into `(pixels, label)`.
    pub fn load(&self, i: usize) -> Result<(Vec<f64>, usize)> {
        let (path, label) = &self.items[i];
        let img = image::open(path)?;
        let resized = img.resize_exact(self.shape.width as u32, self.shape.height as u32, FilterType::CatmullRom);
        let rgb = resized.to_rgb8();
        Ok((rgb.pixels().flat_map(|p| p.0.iter().map(|&c| c as f64 / 255.0)).collect(), *label))
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Applies CLIP normalisation to an interleaved RGB buffer.
pub fn clip_normalize(pixels: &mut [f64]) {
    for px in pixels.chunks_mut(3) {
        for (c, v) in px.iter_mut().enumerate() {
            *v = (*v - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
}

/// Streams an [`ImageFolder`] as multi-view samples: the decoded image
/// followed by `n_views - 1` AugMix views, all CLIP-normalised.
pub struct AugmentedStream {
    folder: ImageFolder,
    augmenter: AugMix,
    n_views: usize,
    rng: StdRng,
    cursor: usize,
}

impl AugmentedStream {
    pub fn new(folder: ImageFolder, n_views: usize, seed: u64) -> Self {
        let augmenter = AugMix::new(folder.shape, 1.0);
        AugmentedStream { folder, augmenter, n_views, rng: StdRng::seed_from_u64(seed), cursor: 0 }
    }
}

impl TestStream for AugmentedStream {
    fn len(&self) -> usize {
        self.folder.len()
    }

    fn skip_to(&mut self, index: usize) {
        debug!(index, "image stream repositioned");
        self.cursor = index.min(self.folder.len());
    }

    fn next_sample(&mut self) -> Result<Option<Sample>> {
        if self.cursor >= self.folder.len() {
            return Ok(None);
        }
        let (pixels, label) = self.folder.load(self.cursor)?;
        let mut views = self.augmenter.views(&pixels, self.n_views, &mut self.rng)?;
        views.iter_mut().for_each(|v| clip_normalize(v));

        let sample = Sample { index: self.cursor, views, label };
        self.cursor += 1;
        Ok(Some(sample))
    }
}
