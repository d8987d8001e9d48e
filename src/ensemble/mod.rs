pub mod caption_bridge;
pub mod policy;

pub use caption_bridge::{CaptionBridge, CaptionScores, DEFAULT_CAPTION_PREFIX};
pub use policy::{entropy_weights, EnsemblePolicy, Fusion, STD_DEV_TOP_K};
