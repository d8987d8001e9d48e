use std::path::PathBuf;

/// Every failure the adaptation pipeline can surface to its caller.
///
/// Interrupts are not errors: a stopped loop returns normally with the
/// statistics gathered so far.
#[derive(Debug, thiserror::Error)]
pub enum TptError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown ensemble policy `{0}` (expected entropy, std_dev or harmonic_mean)")]
    UnknownPolicy(String),

    #[error("std_dev fusion only supports top-k = {expected}, got {actual}")]
    UnsupportedTopK { expected: usize, actual: usize },

    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("captioner failed: {0}")]
    Captioner(String),

    #[error("checkpoint {}: {reason}", path.display())]
    Checkpoint { path: PathBuf, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TptError>;
