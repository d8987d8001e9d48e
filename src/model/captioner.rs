use crate::error::{Result, TptError};
use crate::math::matrix::{dot, normalize, Matrix};
use crate::model::text_encoder::HashedTextEncoder;

/// An image captioner with its own text tower.
pub trait Captioner {
    /// One caption per view, each starting from `prefix`.
    fn generate_captions(&mut self, views: &[Vec<f64>], prefix: &str) -> Result<Vec<String>>;

    /// Unnormalized text embeddings, one row per text.
    fn encode_text(&self, texts: &[String]) -> Result<Matrix>;

    /// Log of the similarity temperature; callers apply `exp()`.
    fn logit_scale(&self) -> f64;
}

/// Captions a view with the phrase of its most similar prototype.
///
/// Prototypes live in image space; similarity is cosine. Text is encoded
/// with a [`HashedTextEncoder`].
#[derive(Debug, Clone)]
pub struct PrototypeCaptioner {
    prototypes: Vec<(String, Vec<f64>)>,
    encoder: HashedTextEncoder,
    log_scale: f64,
}

impl PrototypeCaptioner {
    pub fn new(prototypes: Vec<(String, Vec<f64>)>, encoder: HashedTextEncoder, log_scale: f64) -> Result<Self> {
        let dim = prototypes.first().map(|(_, v)| v.len()).ok_or_else(|| {
            TptError::Config("captioner needs at least one prototype".into())
        })?;
        if let Some((phrase, v)) = prototypes.iter().find(|(_, v)| v.len() != dim) {
            return Err(TptError::Config(format!(
                "prototype `{}` has {} dims, expected {}",
                phrase,
                v.len(),
                dim
            )));
        }
        let prototypes = prototypes.into_iter().map(|(p, v)| (p, normalize(&v))).collect();
        Ok(PrototypeCaptioner { prototypes, encoder, log_scale })
    }

    fn nearest(&self, view: &[f64]) -> &str {
        let v = normalize(view);
        self.prototypes.iter()
            .map(|(phrase, proto)| (phrase, dot(&v, proto)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(phrase, _)| phrase.as_str())
            .unwrap_or("")
    }
}

impl Captioner for PrototypeCaptioner {
    fn generate_captions(&mut self, views: &[Vec<f64>], prefix: &str) -> Result<Vec<String>> {
        let dim = self.prototypes[0].1.len();
        views.iter()
            .map(|view| {
                if view.len() != dim {
                    return Err(TptError::Captioner(format!(
                        "view has {} values, captioner expects {}",
                        view.len(),
                        dim
                    )));
                }
                Ok(format!("{}{}", prefix, self.nearest(view)))
            })
            .collect()
    }

    fn encode_text(&self, texts: &[String]) -> Result<Matrix> {
        Ok(self.encoder.encode_batch(texts))
    }

    fn logit_scale(&self) -> f64 {
        self.log_scale
    }
}
