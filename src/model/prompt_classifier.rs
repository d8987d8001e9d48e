use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::debug;

use crate::error::{Result, TptError};
use crate::math::matrix::{dot, l2_norm, normalize, Matrix};
use crate::model::backbone::{Backbone, Forward};
use crate::model::text_encoder::HashedTextEncoder;

/// CLIP's learned temperature, already exponentiated.
pub const DEFAULT_LOGIT_SCALE: f64 = 100.0;

/// Cosine classifier with a learnable shared context prompt.
///
/// Image features: `v_i = normalize(x_i · W_img)`.
/// Text features:  `t_c = normalize((e_c + mean_j ctx_j) · W_txt)` where `e_c`
/// is the frozen class-name embedding.
/// Logits:         `z_ic = scale · v_i · t_c`.
///
/// Everything except `ctx` is frozen.
#[derive(Debug, Clone)]
pub struct PromptClassifier {
    class_names: Vec<String>,
    image_proj: Matrix,
    class_embed: Matrix,
    text_proj: Matrix,
    n_ctx: usize,
    ctx: Vec<f64>,
    initial_ctx: Vec<f64>,
    logit_scale: f64,
    training: bool,
    cache: Option<ForwardCache>,
}

#[derive(Debug, Clone)]
struct ForwardCache {
    image_features: Matrix,
    text_features: Matrix,
    text_norms: Vec<f64>,
}

impl PromptClassifier {
    /// Builds a classifier with seeded frozen projections. Class names are
    /// embedded with a [`HashedTextEncoder`]; the context is initialised from
    /// the words of `ctx_init` (e.g. `"a_photo_of_a"` gives four context
    /// vectors).
    pub fn new(
        class_names: Vec<String>,
        input_dim: usize,
        embed_dim: usize,
        ctx_init: &str,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let encoder = HashedTextEncoder::new(embed_dim, seed);

        let tokens = HashedTextEncoder::tokenize(ctx_init);
        if tokens.is_empty() {
            return Err(TptError::Config(format!("context init `{}` has no words", ctx_init)));
        }
        let ctx = Matrix::from_rows(tokens.iter().map(|t| encoder.token_embedding(t)).collect())?;
        let class_embed = encoder.encode_batch(&class_names);

        PromptClassifier::from_parts(
            class_names,
            Matrix::xavier(input_dim, embed_dim, &mut rng),
            class_embed,
            Matrix::xavier(embed_dim, embed_dim, &mut rng),
            ctx,
            DEFAULT_LOGIT_SCALE,
        )
    }

    /// Assembles a classifier from explicit weights.
    ///
    /// Shapes: `image_proj` (input × d), `class_embed` (C × d), `text_proj`
    /// (d × d), `ctx` (n_ctx × d).
    pub fn from_parts(
        class_names: Vec<String>,
        image_proj: Matrix,
        class_embed: Matrix,
        text_proj: Matrix,
        ctx: Matrix,
        logit_scale: f64,
    ) -> Result<Self> {
        let d = image_proj.cols;
        let checks = [
            ("class_embed", (class_names.len(), d), class_embed.shape()),
            ("text_proj", (d, d), text_proj.shape()),
            ("ctx", (ctx.rows.max(1), d), ctx.shape()),
        ];
        for (context, expected, actual) in checks {
            if expected != actual {
                return Err(TptError::ShapeMismatch { context, expected, actual });
            }
        }

        let n_ctx = ctx.rows;
        let flat: Vec<f64> = ctx.data.into_iter().flatten().collect();
        Ok(PromptClassifier {
            class_names,
            image_proj,
            class_embed,
            text_proj,
            n_ctx,
            initial_ctx: flat.clone(),
            ctx: flat,
            logit_scale,
            training: true,
            cache: None,
        })
    }

    pub fn embed_dim(&self) -> usize {
        self.image_proj.cols
    }

    pub fn input_dim(&self) -> usize {
        self.image_proj.rows
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn mean_context(&self) -> Vec<f64> {
        let d = self.embed_dim();
        let mut m = vec![0.0; d];
        for chunk in self.ctx.chunks(d) {
            for (a, x) in m.iter_mut().zip(chunk) {
                *a += x;
            }
        }
        let inv = 1.0 / self.n_ctx as f64;
        m.iter_mut().for_each(|a| *a *= inv);
        m
    }

    /// Unnormalized text features `(e_c + m) · W_txt`, one row per class.
    fn prompted_text(&self) -> Matrix {
        let m = self.mean_context();
        let mut prompted = self.class_embed.clone();
        for row in prompted.data.iter_mut() {
            row.iter_mut().zip(&m).for_each(|(e, c)| *e += c);
        }
        &prompted * &self.text_proj
    }
}

impl Backbone for PromptClassifier {
    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn forward(&mut self, views: &[Vec<f64>]) -> Result<Forward> {
        let images = Matrix::from_rows(views.to_vec())?;
        if images.cols != self.input_dim() {
            return Err(TptError::ShapeMismatch {
                context: "PromptClassifier::forward",
                expected: (images.rows, self.input_dim()),
                actual: images.shape(),
            });
        }

        let mut image_features = &images * &self.image_proj;
        for row in image_features.data.iter_mut() {
            *row = normalize(row);
        }

        let text_raw = self.prompted_text();
        let text_norms: Vec<f64> = text_raw.data.iter().map(|r| l2_norm(r).max(1e-12)).collect();
        let text_features = Matrix {
            rows: text_raw.rows,
            cols: text_raw.cols,
            data: text_raw.data.iter().zip(&text_norms)
                .map(|(r, n)| r.iter().map(|x| x / n).collect())
                .collect(),
        };

        let mut logits = Matrix::zeros(image_features.rows, text_features.rows);
        for (i, v) in image_features.data.iter().enumerate() {
            for (c, t) in text_features.data.iter().enumerate() {
                logits.data[i][c] = self.logit_scale * dot(v, t);
            }
        }

        self.cache = if self.training {
            Some(ForwardCache {
                image_features,
                text_features: text_features.clone(),
                text_norms,
            })
        } else {
            None
        };

        Ok(Forward { logits, text_features })
    }

    fn backward(&mut self, grad_logits: &Matrix) -> Result<Vec<f64>> {
        let cache = self.cache.as_ref().ok_or_else(|| {
            TptError::Config("backward called without a training-mode forward".into())
        })?;
        let expected = (cache.image_features.rows, cache.text_features.rows);
        if grad_logits.shape() != expected {
            return Err(TptError::ShapeMismatch {
                context: "PromptClassifier::backward",
                expected,
                actual: grad_logits.shape(),
            });
        }

        // ∂L/∂t_c = scale · Σ_i g_ic v_i
        let d_text = &grad_logits.transpose() * &cache.image_features;

        // Through the row normalisation, summed over classes: ∂L/∂(e_c + m) shares m.
        let d = self.embed_dim();
        let mut d_u_sum = vec![0.0; d];
        for (c, t) in cache.text_features.data.iter().enumerate() {
            let g: Vec<f64> = d_text.data[c].iter().map(|x| x * self.logit_scale).collect();
            let proj = dot(t, &g);
            for k in 0..d {
                d_u_sum[k] += (g[k] - t[k] * proj) / cache.text_norms[c];
            }
        }

        // u = (e + m) · W_txt  =>  ∂L/∂m = (Σ_c ∂L/∂u_c) · W_txtᵀ
        let mut d_mean = vec![0.0; d];
        for k in 0..d {
            d_mean[k] = dot(&self.text_proj.data[k], &d_u_sum);
        }

        let inv = 1.0 / self.n_ctx as f64;
        let mut grad = Vec::with_capacity(self.ctx.len());
        for _ in 0..self.n_ctx {
            grad.extend(d_mean.iter().map(|g| g * inv));
        }
        Ok(grad)
    }

    fn parameters(&self) -> &[f64] {
        &self.ctx
    }

    fn parameters_mut(&mut self) -> &mut [f64] {
        &mut self.ctx
    }

    fn reset(&mut self) {
        self.ctx.copy_from_slice(&self.initial_ctx);
        self.cache = None;
    }

    fn set_training(&mut self, training: bool) {
        if self.training != training {
            debug!(training, "backbone mode switch");
        }
        self.training = training;
        if !training {
            self.cache = None;
        }
    }
}
