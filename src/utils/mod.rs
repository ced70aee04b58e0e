//! Tensor conversion helpers shared by the model session

pub mod postprocessing;
pub mod preprocessing;

pub use postprocessing::{ImagePostprocessor, Segmentation};
pub use preprocessing::ImagePreprocessor;
