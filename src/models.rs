//! Segmentation model registry
//!
//! Describes the rembg model family: which ONNX file backs each model name,
//! the input resolution it expects and how its input has to be normalized.

use crate::error::{BgRemovalError, Result};
use serde::Serialize;
use std::path::PathBuf;

/// `ImageNet` channel means used by most rembg models
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// `ImageNet` channel standard deviations used by most rembg models
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Model input preprocessing parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreprocessingConfig {
    /// Model input size as `[width, height]`
    pub target_size: [u32; 2],
    pub normalization_mean: [f32; 3],
    pub normalization_std: [f32; 3],
}

/// Activation applied to the raw model output before min-max normalization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputActivation {
    /// Output is already a probability map
    None,
    /// Output is logits (`BiRefNet`)
    Sigmoid,
}

/// Model information and metadata
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub precision: String,
    pub size_bytes: usize,
    /// NCHW
    pub input_shape: (usize, usize, usize, usize),
    pub output_shape: (usize, usize, usize, usize),
}

/// Static description of one downloadable model
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub file_name: &'static str,
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub activation: OutputActivation,
    pub description: &'static str,
}

impl ModelDescriptor {
    /// Preprocessing parameters for this model
    #[must_use]
    pub fn preprocessing(&self) -> PreprocessingConfig {
        PreprocessingConfig {
            target_size: [self.input_size, self.input_size],
            normalization_mean: self.mean,
            normalization_std: self.std,
        }
    }

    /// Download URL of the model file under `base_url`
    #[must_use]
    pub fn download_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.file_name)
    }
}

const REGISTRY: &[ModelDescriptor] = &[
    ModelDescriptor {
        name: "isnet-general-use",
        file_name: "isnet-general-use.onnx",
        input_size: 1024,
        mean: [0.5, 0.5, 0.5],
        std: [1.0, 1.0, 1.0],
        activation: OutputActivation::None,
        description: "IS-Net general purpose segmentation",
    },
    ModelDescriptor {
        name: "isnet-anime",
        file_name: "isnet-anime.onnx",
        input_size: 1024,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
        activation: OutputActivation::None,
        description: "IS-Net tuned for anime characters",
    },
    ModelDescriptor {
        name: "u2net",
        file_name: "u2net.onnx",
        input_size: 320,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
        activation: OutputActivation::None,
        description: "U2-Net general purpose salient object detection",
    },
    ModelDescriptor {
        name: "u2netp",
        file_name: "u2netp.onnx",
        input_size: 320,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
        activation: OutputActivation::None,
        description: "Lightweight U2-Net",
    },
    ModelDescriptor {
        name: "u2net_human_seg",
        file_name: "u2net_human_seg.onnx",
        input_size: 320,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
        activation: OutputActivation::None,
        description: "U2-Net trained for human segmentation",
    },
    ModelDescriptor {
        name: "silueta",
        file_name: "silueta.onnx",
        input_size: 320,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
        activation: OutputActivation::None,
        description: "Size-reduced U2-Net",
    },
    ModelDescriptor {
        name: "birefnet-general",
        file_name: "BiRefNet-general-epoch_244.onnx",
        input_size: 1024,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
        activation: OutputActivation::Sigmoid,
        description: "BiRefNet general purpose segmentation",
    },
    ModelDescriptor {
        name: "birefnet-general-lite",
        file_name: "BiRefNet-general-bb_swin_v1_tiny-epoch_232.onnx",
        input_size: 1024,
        mean: IMAGENET_MEAN,
        std: IMAGENET_STD,
        activation: OutputActivation::Sigmoid,
        description: "BiRefNet with a Swin-T backbone",
    },
];

/// Look up a model by its rembg name
///
/// # Errors
/// - The name is not in the registry
pub fn lookup(name: &str) -> Result<&'static ModelDescriptor> {
    REGISTRY
        .iter()
        .find(|descriptor| descriptor.name == name)
        .ok_or_else(|| {
            BgRemovalError::model(format!(
                "Unknown model '{name}'. Available models: {}",
                available_models().join(", ")
            ))
        })
}

/// Names of every registered model
#[must_use]
pub fn available_models() -> Vec<&'static str> {
    REGISTRY.iter().map(|descriptor| descriptor.name).collect()
}

/// Model file on disk plus the metadata needed to run it
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub name: String,
    pub path: PathBuf,
    pub preprocessing: PreprocessingConfig,
    pub activation: OutputActivation,
}

impl ModelSpec {
    /// Pair a registry descriptor with the resolved file location
    #[must_use]
    pub fn from_descriptor(descriptor: &ModelDescriptor, path: PathBuf) -> Self {
        Self {
            name: descriptor.name.to_string(),
            path,
            preprocessing: descriptor.preprocessing(),
            activation: descriptor.activation,
        }
    }

    /// Read the raw ONNX bytes
    ///
    /// # Errors
    /// - Model file missing or unreadable
    pub fn load_model_data(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.path)
            .map_err(|e| BgRemovalError::file_io_error("read model file", &self.path, &e))
    }

    /// Model metadata derived from the file and the preprocessing parameters
    ///
    /// # Errors
    /// - Model file missing or unreadable
    pub fn model_info(&self) -> Result<ModelInfo> {
        let metadata = std::fs::metadata(&self.path)
            .map_err(|e| BgRemovalError::file_io_error("inspect model file", &self.path, &e))?;
        let [width, height] = self.preprocessing.target_size;

        Ok(ModelInfo {
            name: self.name.clone(),
            precision: "fp32".to_string(),
            size_bytes: usize::try_from(metadata.len()).unwrap_or(usize::MAX),
            input_shape: (1, 3, height as usize, width as usize),
            output_shape: (1, 1, height as usize, width as usize),
        })
    }
}

/// Where the weights for a session come from
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    /// Explicit file on disk
    External(PathBuf),
    /// Registry model resolved through the cache (downloaded on demand)
    Cached(&'static ModelDescriptor),
}

impl ModelSource {
    /// Get a display name for tracing and logging
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            ModelSource::External(path) => {
                format!(
                    "external:{}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                )
            },
            ModelSource::Cached(descriptor) => format!("cached:{}", descriptor.name),
        }
    }
}
