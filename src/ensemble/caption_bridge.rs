use crate::error::{Result, TptError};
use crate::math::matrix::{dot, normalize, Matrix};
use crate::model::captioner::Captioner;

/// Default caption prefix handed to the captioner.
pub const DEFAULT_CAPTION_PREFIX: &str = "a ";

/// Captions produced for a batch and the class distribution derived from them.
#[derive(Debug, Clone)]
pub struct CaptionScores {
    pub captions: Vec<String>,
    pub probs: Matrix,
}

/// Caption-then-classify path: caption each view, then score the caption
/// against `"A photo of {class}"` in the captioner's text space.
pub struct CaptionBridge {
    class_prompts: Vec<String>,
    prefix: String,
    class_features: Option<Matrix>,
}

impl CaptionBridge {
    pub fn new(class_names: &[String], prefix: impl Into<String>) -> Self {
        CaptionBridge {
            class_prompts: class_names.iter().map(|c| format!("A photo of {}", c)).collect(),
            prefix: prefix.into(),
            class_features: None,
        }
    }

    /// Row-softmaxed `exp(logit_scale) · cos(caption, class)` for each view.
    ///
    /// Class prompt embeddings are computed on first use and reused; captioner
    /// failures propagate.
    pub fn class_probabilities(
        &mut self,
        captioner: &mut dyn Captioner,
        views: &[Vec<f64>],
    ) -> Result<CaptionScores> {
        let captions = captioner.generate_captions(views, &self.prefix)?;
        if captions.len() != views.len() {
            return Err(TptError::Captioner(format!(
                "{} captions for {} views",
                captions.len(),
                views.len()
            )));
        }

        let class_features = match self.class_features.take() {
            Some(f) => f,
            None => normalize_rows(&captioner.encode_text(&self.class_prompts)?),
        };
        let class_features = &*self.class_features.insert(class_features);

        let caption_features = normalize_rows(&captioner.encode_text(&captions)?);
        if caption_features.cols != class_features.cols {
            return Err(TptError::ShapeMismatch {
                context: "CaptionBridge text features",
                expected: (caption_features.rows, class_features.cols),
                actual: caption_features.shape(),
            });
        }

        let scale = captioner.logit_scale().exp();
        let mut logits = Matrix::zeros(caption_features.rows, class_features.rows);
        for (i, cap) in caption_features.data.iter().enumerate() {
            for (c, cls) in class_features.data.iter().enumerate() {
                logits.data[i][c] = scale * dot(cap, cls);
            }
        }

        Ok(CaptionScores { captions, probs: logits.softmax_rows() })
    }
}

fn normalize_rows(m: &Matrix) -> Matrix {
    Matrix {
        rows: m.rows,
        cols: m.cols,
        data: m.data.iter().map(|r| normalize(r)).collect(),
    }
}
