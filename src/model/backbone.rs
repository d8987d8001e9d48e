use crate::error::Result;
use crate::math::matrix::Matrix;

/// Output of one backbone forward pass over a batch of views.
#[derive(Debug, Clone)]
pub struct Forward {
    /// Unnormalized class scores, one row per view.
    pub logits: Matrix,
    /// Normalized class text features, one row per class.
    pub text_features: Matrix,
}

/// A frozen vision-language classifier whose only trainable weights are a
/// continuous prompt.
///
/// Like a dense layer that keeps its pre-activations for backprop, a backbone
/// in training mode caches what its last `forward` needs so that `backward`
/// can turn `∂L/∂logits` into `∂L/∂prompt`.
pub trait Backbone {
    fn class_names(&self) -> &[String];

    fn forward(&mut self, views: &[Vec<f64>]) -> Result<Forward>;

    /// Gradient of the loss w.r.t. the prompt parameters, laid out like
    /// [`Backbone::parameters`]. `grad_logits` must match the shape of the
    /// logits of the last training-mode forward.
    fn backward(&mut self, grad_logits: &Matrix) -> Result<Vec<f64>>;

    /// Trainable prompt parameters, flattened.
    fn parameters(&self) -> &[f64];

    fn parameters_mut(&mut self) -> &mut [f64];

    /// Restores the prompt to the snapshot taken at construction.
    fn reset(&mut self);

    /// Training mode caches activations for `backward`; eval mode does not.
    fn set_training(&mut self, training: bool);

    fn num_classes(&self) -> usize {
        self.class_names().len()
    }
}
