pub mod augment;
pub mod dataset;
pub mod image_folder;
pub mod sample;

pub use augment::{AugMix, ImageShape};
pub use dataset::DatasetKind;
pub use image_folder::{AugmentedStream, ImageFolder};
pub use sample::{Sample, TestStream, VecStream};
