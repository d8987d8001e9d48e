pub mod backbone;
pub mod captioner;
pub mod device;
pub mod prompt_classifier;
pub mod text_encoder;

pub use backbone::{Backbone, Forward};
pub use captioner::{Captioner, PrototypeCaptioner};
pub use device::Device;
pub use prompt_classifier::PromptClassifier;
pub use text_encoder::HashedTextEncoder;
