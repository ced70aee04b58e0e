//! Inference backend abstraction and factory

use crate::config::{BackendConfig, BackendType};
use crate::error::{BgRemovalError, Result};
use crate::models::{ModelInfo, ModelSpec, PreprocessingConfig};
use ndarray::Array4;
use std::time::Duration;

/// Trait for inference backends
///
/// A backend is initialized once and then shared between request handlers,
/// so `infer` takes `&self`. Backends whose engine needs exclusive access
/// serialize internally and report `is_reentrant() == false`.
pub trait InferenceBackend: Send + Sync {
    /// Initialize the backend with the given configuration
    ///
    /// Returns the model load time, or `None` if the backend was already initialized.
    ///
    /// # Errors
    /// - Backend initialization failures
    /// - Model loading or validation errors
    fn initialize(&mut self, config: &BackendConfig) -> Result<Option<Duration>>;

    /// Run inference on an NCHW input tensor
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Model inference failures
    /// - Tensor conversion or processing errors
    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>>;

    /// Get the expected input shape for this backend
    fn input_shape(&self) -> (usize, usize, usize, usize);

    /// Get the expected output shape for this backend
    fn output_shape(&self) -> (usize, usize, usize, usize);

    /// Get preprocessing configuration for this backend
    ///
    /// # Errors
    /// - No model configured
    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig>;

    /// Get model information for this backend
    ///
    /// # Errors
    /// - No model configured
    /// - Model metadata unavailable
    fn get_model_info(&self) -> Result<ModelInfo>;

    /// Check if backend is initialized
    fn is_initialized(&self) -> bool;

    /// Whether concurrent `infer` calls run in parallel rather than queueing internally
    fn is_reentrant(&self) -> bool {
        true
    }
}

/// Factory trait for creating inference backends
pub trait BackendFactory: Send + Sync {
    /// Create an uninitialized backend of the given type for `model`
    ///
    /// # Errors
    /// - Backend type not compiled into this build
    fn create_backend(
        &self,
        backend_type: BackendType,
        model: ModelSpec,
    ) -> Result<Box<dyn InferenceBackend>>;

    /// Get list of available backend types
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Backend factory for the engines enabled by cargo features
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(
        &self,
        backend_type: BackendType,
        model: ModelSpec,
    ) -> Result<Box<dyn InferenceBackend>> {
        match backend_type {
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(crate::backends::TractBackend::with_model(model))),
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(crate::backends::OnnxBackend::with_model(model))),
            #[allow(unreachable_patterns)]
            other => {
                let _ = model;
                Err(BgRemovalError::invalid_config(format!(
                    "Backend '{other}' is not available in this build (enable the '{other}' feature)"
                )))
            },
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        backends
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockBackend;
    use crate::models;
    use std::path::PathBuf;

    fn spec() -> ModelSpec {
        ModelSpec::from_descriptor(
            models::lookup("u2netp").unwrap(),
            PathBuf::from("/models/u2netp.onnx"),
        )
    }

    #[test]
    fn test_default_factory_lists_compiled_backends() {
        let backends = DefaultBackendFactory.available_backends();
        assert_eq!(backends.contains(&BackendType::Tract), cfg!(feature = "tract"));
        assert_eq!(backends.contains(&BackendType::Onnx), cfg!(feature = "onnx"));
    }

    #[cfg(feature = "tract")]
    #[test]
    fn test_default_factory_creates_tract_backend() {
        let backend = DefaultBackendFactory
            .create_backend(BackendType::Tract, spec())
            .unwrap();
        assert!(!backend.is_initialized());
        assert!(backend.is_reentrant());
        assert_eq!(backend.input_shape(), (1, 3, 320, 320));
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_default_factory_rejects_disabled_backend() {
        let result = DefaultBackendFactory.create_backend(BackendType::Onnx, spec());
        let err = result.err().unwrap();
        assert!(err.to_string().contains("not available"));
    }

    #[test]
    fn test_backend_trait_object_operations() {
        let mut backend: Box<dyn InferenceBackend> = Box::new(MockBackend::new());
        assert!(!backend.is_initialized());

        backend.initialize(&BackendConfig::default()).unwrap();
        assert!(backend.is_initialized());

        let (n, c, h, w) = backend.input_shape();
        let output = backend.infer(&Array4::zeros((n, c, h, w))).unwrap();
        assert_eq!(output.dim(), backend.output_shape());
    }
}
