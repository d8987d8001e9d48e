use rand::prelude::*;
use rand_distr::{Beta, Dirichlet, Distribution};

use crate::error::{Result, TptError};

/// Interleaved RGB image geometry (`R, G, B` per pixel, row-major, values in
/// `[0, 1]`), the layout produced by the image-folder loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub width: usize,
    pub height: usize,
}

impl ImageShape {
    pub fn len(&self) -> usize {
        self.width * self.height * 3
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One primitive augmentation.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    ColorJitter,
    HorizontalFlip,
    PaddedCrop,
}

const OPS: [Op; 3] = [Op::ColorJitter, Op::HorizontalFlip, Op::PaddedCrop];

/// AugMix-style view generator: `width` random chains of 1–2 primitive ops
/// mixed with Dirichlet weights, then blended with the original using a
/// Beta-distributed factor.
#[derive(Debug, Clone)]
pub struct AugMix {
    pub shape: ImageShape,
    pub severity: f64,
    pub width: usize,
    pub alpha: f64,
}

impl AugMix {
    pub fn new(shape: ImageShape, severity: f64) -> Self {
        AugMix { shape, severity, width: 3, alpha: 1.0 }
    }

    /// Returns `[image, aug_1, …, aug_{n_views-1}]`.
    pub fn views<R: Rng + ?Sized>(&self, image: &[f64], n_views: usize, rng: &mut R) -> Result<Vec<Vec<f64>>> {
        let mut views = Vec::with_capacity(n_views.max(1));
        views.push(image.to_vec());
        for _ in 1..n_views {
            views.push(self.augment(image, rng)?);
        }
        Ok(views)
    }

    pub fn augment<R: Rng + ?Sized>(&self, image: &[f64], rng: &mut R) -> Result<Vec<f64>> {
        if image.len() != self.shape.len() {
            return Err(TptError::ShapeMismatch {
                context: "AugMix::augment",
                expected: (self.shape.len(), 1),
                actual: (image.len(), 1),
            });
        }
        let config_err = |e: String| TptError::Config(format!("augmix: {}", e));
        let ws: Vec<f64> = Dirichlet::new(&vec![self.alpha; self.width])
            .map_err(|e| config_err(e.to_string()))?
            .sample(rng);
        let m: f64 = Beta::new(self.alpha, self.alpha)
            .map_err(|e| config_err(e.to_string()))?
            .sample(rng);

        let mut mix = vec![0.0; image.len()];
        for w in ws {
            let depth = rng.gen_range(1..=2);
            let mut chain = image.to_vec();
            for _ in 0..depth {
                let op = *OPS.choose(rng).unwrap_or(&Op::HorizontalFlip);
                chain = self.apply(op, &chain, rng);
            }
            for (acc, x) in mix.iter_mut().zip(&chain) {
                *acc += w * x;
            }
        }

        Ok(image.iter().zip(&mix).map(|(x, y)| (1.0 - m) * x + m * y).collect())
    }

    fn apply<R: Rng + ?Sized>(&self, op: Op, image: &[f64], rng: &mut R) -> Vec<f64> {
        match op {
            Op::HorizontalFlip => {
                if rng.gen_bool(0.5) { flip_horizontal(image, self.shape) } else { image.to_vec() }
            }
            Op::PaddedCrop => {
                let pad = (self.shape.width.min(self.shape.height) as f64 * 0.125) as i64;
                let dx = rng.gen_range(-pad..=pad);
                let dy = rng.gen_range(-pad..=pad);
                shift(image, self.shape, dx, dy)
            }
            Op::ColorJitter => {
                let spread = 0.8 * self.severity;
                let lo = (1.0 - spread).max(0.0);
                let hi = 1.0 + spread;
                let brightness = rng.gen_range(lo..=hi);
                let contrast = rng.gen_range(lo..=hi);
                let saturation = rng.gen_range(lo..=hi);
                color_jitter(image, brightness, contrast, saturation)
            }
        }
    }
}

pub fn flip_horizontal(image: &[f64], shape: ImageShape) -> Vec<f64> {
    let mut out = vec![0.0; image.len()];
    for y in 0..shape.height {
        for x in 0..shape.width {
            let src = (y * shape.width + x) * 3;
            let dst = (y * shape.width + (shape.width - 1 - x)) * 3;
            out[dst..dst + 3].copy_from_slice(&image[src..src + 3]);
        }
    }
    out
}

/// Translates by `(dx, dy)` pixels, filling uncovered pixels with zero (the
/// effect of a padded random crop at the original size).
pub fn shift(image: &[f64], shape: ImageShape, dx: i64, dy: i64) -> Vec<f64> {
    let (w, h) = (shape.width as i64, shape.height as i64);
    let mut out = vec![0.0; image.len()];
    for y in 0..h {
        for x in 0..w {
            let (sx, sy) = (x + dx, y + dy);
            if sx < 0 || sy < 0 || sx >= w || sy >= h {
                continue;
            }
            let src = ((sy * w + sx) * 3) as usize;
            let dst = ((y * w + x) * 3) as usize;
            out[dst..dst + 3].copy_from_slice(&image[src..src + 3]);
        }
    }
    out
}

fn color_jitter(image: &[f64], brightness: f64, contrast: f64, saturation: f64) -> Vec<f64> {
    let mut out: Vec<f64> = image.iter().map(|x| (x * brightness).clamp(0.0, 1.0)).collect();

    let mean = out.iter().sum::<f64>() / out.len().max(1) as f64;
    out.iter_mut().for_each(|x| *x = ((*x - mean) * contrast + mean).clamp(0.0, 1.0));

    for px in out.chunks_mut(3) {
        let gray = 0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2];
        for c in px.iter_mut() {
            *c = (gray + (*c - gray) * saturation).clamp(0.0, 1.0);
        }
    }
    out
}
