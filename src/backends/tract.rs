//! Tract backend implementation for background removal models
//!
//! Tract is a pure Rust inference engine. Its optimized plans are immutable
//! after construction and `run` takes `&self`, so a single loaded model can
//! serve concurrent requests without locking.

use crate::config::BackendConfig;
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelSpec, PreprocessingConfig};
use ndarray::Array4;
use std::time::{Duration, Instant};
use tract_onnx::prelude::*;

/// Type alias for the complex Tract model type to reduce complexity warnings
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Tract backend for running background removal models using pure Rust inference
#[derive(Debug)]
pub struct TractBackend {
    model: Option<TractModel>,
    spec: Option<ModelSpec>,
    initialized: bool,
}

impl TractBackend {
    /// Create a new uninitialized Tract backend without a model
    #[must_use]
    pub fn new() -> Self {
        Self {
            model: None,
            spec: None,
            initialized: false,
        }
    }

    /// Create a Tract backend for the given model file
    #[must_use]
    pub fn with_model(spec: ModelSpec) -> Self {
        Self {
            model: None,
            spec: Some(spec),
            initialized: false,
        }
    }

    /// Load, optimize and plan the model with a fixed NCHW input fact
    fn load_model(&mut self, config: &BackendConfig) -> Result<Duration> {
        let model_load_start = Instant::now();

        let Some(ref spec) = self.spec else {
            return Err(BgRemovalError::model("No model configured for Tract backend"));
        };

        let model_info = spec.model_info()?;
        let [width, height] = spec.preprocessing.target_size;

        log::info!("Initializing Tract backend");
        log::info!("Model: {} ({})", model_info.name, model_info.precision);
        #[allow(clippy::cast_precision_loss)]
        let size_mb = model_info.size_bytes as f64 / (1024.0 * 1024.0);
        log::info!("Model size: {size_mb:.2} MB");
        if config.intra_threads > 0 || config.inter_threads > 0 {
            log::debug!("Thread settings are ignored by the Tract backend");
        }

        let model = onnx()
            .model_for_path(&spec.path)
            .map_err(|e| BgRemovalError::model(format!("Failed to load ONNX model: {e}")))?
            .with_input_fact(
                0,
                f32::fact([1, 3, height as usize, width as usize]).into(),
            )
            .map_err(|e| BgRemovalError::model(format!("Failed to set input shape: {e}")))?
            .into_optimized()
            .map_err(|e| BgRemovalError::model(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| {
                BgRemovalError::model(format!("Failed to create runnable model: {e}"))
            })?;

        self.model = Some(model);
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "Tract backend initialized in {}ms",
            model_load_time.as_millis()
        );

        Ok(model_load_time)
    }
}

impl Default for TractBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for TractBackend {
    fn initialize(&mut self, config: &BackendConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| BgRemovalError::inference("Tract model not initialized"))?;

        log::debug!("Running Tract inference on input {:?}", input.shape());
        let inference_start = Instant::now();

        let input_tensor = Tensor::from(input.clone());
        let outputs = model
            .run(tvec![input_tensor.into()])
            .map_err(|e| BgRemovalError::inference(format!("Tract inference failed: {e}")))?;

        let output_tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| BgRemovalError::inference("No output tensor found"))?
            .into_arc_tensor();

        let output_data = output_tensor.to_array_view::<f32>().map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert output tensor: {e}"))
        })?;

        let output_shape = output_data.shape();
        let (n, c, h, w) = match *output_shape {
            [n, c, h, w] => (n, c, h, w),
            [n, h, w] => (n, 1, h, w),
            _ => {
                return Err(BgRemovalError::inference(format!(
                    "Expected 3D or 4D output tensor, got {}D",
                    output_shape.len()
                )))
            },
        };

        let output_array = Array4::from_shape_vec(
            (n, c, h, w),
            output_data.to_owned().into_raw_vec_and_offset().0,
        )
        .map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::debug!(
            "Tract inference completed in {}ms, output {:?}",
            inference_start.elapsed().as_millis(),
            output_array.shape()
        );

        Ok(output_array)
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.spec.as_ref().map_or((1, 3, 1024, 1024), |spec| {
            let [width, height] = spec.preprocessing.target_size;
            (1, 3, height as usize, width as usize)
        })
    }

    fn output_shape(&self) -> (usize, usize, usize, usize) {
        let (n, _, h, w) = self.input_shape();
        (n, 1, h, w)
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        self.spec
            .as_ref()
            .map(|spec| spec.preprocessing.clone())
            .ok_or_else(|| BgRemovalError::internal("No model configured for Tract backend"))
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        self.spec
            .as_ref()
            .ok_or_else(|| BgRemovalError::internal("No model configured for Tract backend"))?
            .model_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_tract_backend_creation() {
        let backend = TractBackend::new();

        assert!(!backend.is_initialized());
        assert!(backend.is_reentrant());
        assert_eq!(backend.input_shape(), (1, 3, 1024, 1024));
        assert_eq!(backend.output_shape(), (1, 1, 1024, 1024));
        assert!(backend.get_model_info().is_err());
        assert!(backend.get_preprocessing_config().is_err());
    }

    #[test]
    fn test_tract_backend_shapes_follow_model() {
        let spec = ModelSpec::from_descriptor(
            models::lookup("u2net").unwrap(),
            PathBuf::from("/models/u2net.onnx"),
        );
        let backend = TractBackend::with_model(spec);

        assert_eq!(backend.input_shape(), (1, 3, 320, 320));
        assert_eq!(backend.output_shape(), (1, 1, 320, 320));
        assert_eq!(
            backend.get_preprocessing_config().unwrap().target_size,
            [320, 320]
        );
    }

    #[test]
    fn test_tract_backend_infer_before_initialize() {
        let backend = TractBackend::new();
        let result = backend.infer(&Array4::zeros((1, 3, 8, 8)));
        assert!(matches!(result, Err(BgRemovalError::Inference(_))));
    }

    #[test]
    fn test_tract_backend_initialize_without_model() {
        let mut backend = TractBackend::new();
        let result = backend.initialize(&BackendConfig::default());
        assert!(matches!(result, Err(BgRemovalError::Model(_))));
        assert!(!backend.is_initialized());
    }

    #[test]
    fn test_tract_backend_rejects_invalid_model_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("u2netp.onnx");
        std::fs::write(&path, b"definitely not protobuf").unwrap();

        let spec = ModelSpec::from_descriptor(models::lookup("u2netp").unwrap(), path);
        let mut backend = TractBackend::with_model(spec);

        assert!(backend.initialize(&BackendConfig::default()).is_err());
        assert!(!backend.is_initialized());
    }
}
