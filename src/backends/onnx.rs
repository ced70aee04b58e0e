//! ONNX Runtime backend implementation for background removal models
//!
//! Supports CPU, CUDA and `CoreML` execution providers. ONNX Runtime sessions
//! need exclusive access to run, so the session sits behind a mutex and
//! concurrent `infer` calls on one backend are serialized.

use crate::config::{BackendConfig, ExecutionProvider};
use crate::error::{BgRemovalError, Result};
use crate::inference::InferenceBackend;
use crate::models::{ModelInfo, ModelSpec, PreprocessingConfig};
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// ONNX Runtime backend for running background removal models
#[derive(Debug)]
pub struct OnnxBackend {
    session: Option<Mutex<Session>>,
    spec: Option<ModelSpec>,
    initialized: bool,
}

impl OnnxBackend {
    /// List all ONNX Runtime execution providers with availability status and descriptions
    pub fn list_providers() -> Vec<(String, bool, String)> {
        let cuda_available =
            OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false);
        let coreml_available =
            OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default())
                .unwrap_or(false);

        vec![
            (
                "CPU".to_string(),
                true,
                "Always available, uses CPU for inference".to_string(),
            ),
            (
                "CUDA".to_string(),
                cuda_available,
                "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)".to_string(),
            ),
            (
                "CoreML".to_string(),
                coreml_available,
                "Apple Silicon GPU and Neural Engine acceleration".to_string(),
            ),
        ]
    }

    /// Create a new uninitialized ONNX backend without a model
    #[must_use]
    pub fn new() -> Self {
        Self {
            session: None,
            spec: None,
            initialized: false,
        }
    }

    /// Create an ONNX backend for the given model file
    #[must_use]
    pub fn with_model(spec: ModelSpec) -> Self {
        Self {
            session: None,
            spec: Some(spec),
            initialized: false,
        }
    }

    /// Execution providers to register for the requested provider, best first
    fn execution_providers(requested: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
        let cuda = || {
            let provider = CUDAExecutionProvider::default();
            OrtExecutionProvider::is_available(&provider)
                .unwrap_or(false)
                .then(|| provider.build())
        };
        let coreml = || {
            let provider = CoreMLExecutionProvider::default();
            OrtExecutionProvider::is_available(&provider)
                .unwrap_or(false)
                .then(|| CoreMLExecutionProvider::default().with_subgraphs(true).build())
        };

        let providers: Vec<ExecutionProviderDispatch> = match requested {
            ExecutionProvider::Auto => [cuda(), coreml()].into_iter().flatten().collect(),
            ExecutionProvider::Cpu => Vec::new(),
            ExecutionProvider::Cuda => cuda().into_iter().collect(),
            ExecutionProvider::CoreMl => coreml().into_iter().collect(),
        };

        if providers.is_empty() && requested != ExecutionProvider::Cpu {
            log::warn!("Execution provider '{requested}' not available, falling back to CPU");
        }
        providers
    }

    /// Load and initialize the ONNX model
    fn load_model(&mut self, config: &BackendConfig) -> Result<Duration> {
        let model_load_start = Instant::now();

        let Some(ref spec) = self.spec else {
            return Err(BgRemovalError::model("No model configured for ONNX backend"));
        };

        let model_info = spec.model_info()?;
        let model_data = spec.load_model_data()?;

        let mut session_builder = Session::builder()
            .map_err(|e| BgRemovalError::model(format!("Failed to create session builder: {e}")))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| {
                BgRemovalError::model(format!("Failed to set optimization level: {e}"))
            })?;

        let providers = Self::execution_providers(config.execution_provider);
        if !providers.is_empty() {
            log::info!(
                "Hardware acceleration enabled with {count} provider(s)",
                count = providers.len()
            );
            session_builder = session_builder
                .with_execution_providers(providers)
                .map_err(|e| {
                    BgRemovalError::model(format!("Failed to set execution providers: {e}"))
                })?;
        }

        let available = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(8);
        let intra_threads = if config.intra_threads > 0 {
            config.intra_threads
        } else {
            available
        };
        let inter_threads = if config.inter_threads > 0 {
            config.inter_threads
        } else {
            (available / 4).max(1)
        };

        let session = session_builder
            .with_parallel_execution(true)
            .map_err(|e| BgRemovalError::model(format!("Failed to enable parallel execution: {e}")))?
            .with_intra_threads(intra_threads)
            .map_err(|e| BgRemovalError::model(format!("Failed to set intra threads: {e}")))?
            .with_inter_threads(inter_threads)
            .map_err(|e| BgRemovalError::model(format!("Failed to set inter threads: {e}")))?
            .commit_from_memory(&model_data)
            .map_err(|e| {
                BgRemovalError::model(format!("Failed to create session from model data: {e}"))
            })?;

        log::debug!(
            "ONNX Runtime session for {} ({}): provider {}, {intra_threads} intra-op / {inter_threads} inter-op threads",
            model_info.name,
            model_info.precision,
            config.execution_provider
        );

        self.session = Some(Mutex::new(session));
        self.initialized = true;

        let model_load_time = model_load_start.elapsed();
        log::info!(
            "ONNX Runtime backend initialized in {}ms",
            model_load_time.as_millis()
        );

        Ok(model_load_time)
    }
}

impl Default for OnnxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for OnnxBackend {
    fn initialize(&mut self, config: &BackendConfig) -> Result<Option<Duration>> {
        if self.initialized {
            return Ok(None);
        }

        let model_load_time = self.load_model(config)?;
        Ok(Some(model_load_time))
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| BgRemovalError::inference("ONNX session not initialized"))?;

        let inference_start = Instant::now();
        log::debug!("Running ONNX inference on input {:?}", input.dim());

        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BgRemovalError::inference(format!("Failed to convert input tensor: {e}"))
        })?;

        let mut session = session.lock();
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BgRemovalError::inference(format!("ONNX inference failed: {e}")))?;

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| BgRemovalError::inference("No output tensors found"))?;
        let output_tensor = outputs
            .get(first_key)
            .ok_or_else(|| BgRemovalError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| {
                BgRemovalError::inference(format!("Failed to extract output tensor: {e}"))
            })?;

        let output_shape = output_tensor.shape().to_vec();
        let (n, c, h, w) = match *output_shape.as_slice() {
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
            output_tensor.view().to_owned().into_raw_vec_and_offset().0,
        )
        .map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))?;

        log::debug!(
            "ONNX inference completed in {}ms",
            inference_start.elapsed().as_millis()
        );

        Ok(output_array)
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
            .ok_or_else(|| BgRemovalError::internal("No model configured for ONNX backend"))
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        self.spec
            .as_ref()
            .ok_or_else(|| BgRemovalError::internal("No model configured for ONNX backend"))?
            .model_info()
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_reentrant(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_onnx_backend_creation() {
        let backend = OnnxBackend::new();
        assert!(!backend.is_initialized());
        assert!(!backend.is_reentrant());
        assert_eq!(backend.input_shape(), (1, 3, 1024, 1024));
        assert_eq!(backend.output_shape(), (1, 1, 1024, 1024));
    }

    #[test]
    fn test_onnx_backend_initialize_without_model() {
        let mut backend = OnnxBackend::new();
        let result = backend.initialize(&BackendConfig::default());
        assert!(matches!(result, Err(BgRemovalError::Model(_))));
    }

    #[test]
    fn test_onnx_backend_infer_before_initialize() {
        let backend = OnnxBackend::new();
        assert!(backend.infer(&Array4::zeros((1, 3, 4, 4))).is_err());
    }

    #[test]
    fn test_list_providers_includes_cpu() {
        let providers = OnnxBackend::list_providers();
        assert!(providers
            .iter()
            .any(|(name, available, _)| name == "CPU" && *available));
    }
}
