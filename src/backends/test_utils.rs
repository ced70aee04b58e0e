//! Test utilities and mock backends for testing inference functionality
//!
//! The mock produces a deterministic circular mask so pipeline tests run
//! without model files or an inference engine. Integration tests reach it
//! through the `test-utils` feature.

use crate::{
    config::BackendConfig,
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
    models::{ModelInfo, PreprocessingConfig},
};
use ndarray::Array4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Inference counters shared between mock backends and the test that owns them
#[derive(Debug, Default)]
pub struct InferenceCounters {
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl InferenceCounters {
    /// Number of `infer` calls seen so far
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of `infer` calls that were running at the same time
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock backend for testing
#[derive(Debug, Clone)]
pub struct MockBackend {
    initialized: bool,
    model_info: ModelInfo,
    preprocessing_config: PreprocessingConfig,
    counters: Arc<InferenceCounters>,
    delay: Duration,
    hard_edge: bool,
    should_fail_init: bool,
    should_fail_inference: bool,
    reentrant: bool,
}

impl MockBackend {
    /// Create a new mock backend with a 32x32 input
    #[must_use]
    pub fn new() -> Self {
        Self::with_size(32)
    }

    #[must_use]
    pub fn with_size(size: usize) -> Self {
        Self {
            initialized: false,
            model_info: ModelInfo {
                name: "mock-model".to_string(),
                precision: "fp32".to_string(),
                size_bytes: 1024 * 1024,
                input_shape: (1, 3, size, size),
                output_shape: (1, 1, size, size),
            },
            preprocessing_config: PreprocessingConfig {
                target_size: [size as u32, size as u32],
                normalization_mean: [0.485, 0.456, 0.406],
                normalization_std: [0.229, 0.224, 0.225],
            },
            counters: Arc::new(InferenceCounters::default()),
            delay: Duration::ZERO,
            hard_edge: false,
            should_fail_init: false,
            should_fail_inference: false,
            reentrant: true,
        }
    }

    /// Create a mock backend that will fail during initialization
    #[must_use]
    pub fn new_failing_init() -> Self {
        let mut backend = Self::new();
        backend.should_fail_init = true;
        backend
    }

    /// Create a mock backend that will fail during inference
    #[must_use]
    pub fn new_failing_inference() -> Self {
        Self::new().failing_inference()
    }

    #[must_use]
    pub fn failing_inference(mut self) -> Self {
        self.should_fail_inference = true;
        self
    }

    #[must_use]
    pub fn non_reentrant(mut self) -> Self {
        self.reentrant = false;
        self
    }

    /// Block the calling thread for `delay` inside every `infer` call
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Binary disc instead of a soft falloff, so the centre is fully opaque
    #[must_use]
    pub fn with_hard_edge(mut self) -> Self {
        self.hard_edge = true;
        self
    }

    /// Report into existing counters, e.g. ones shared by every session a loader builds
    #[must_use]
    pub fn with_counters(mut self, counters: Arc<InferenceCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Counters survive moving the backend into a session
    #[must_use]
    pub fn counters(&self) -> Arc<InferenceCounters> {
        Arc::clone(&self.counters)
    }

    fn generate_mock_output(&self, batch_size: usize) -> Array4<f32> {
        let (_, _, height, width) = self.model_info.output_shape;
        let center_x = width as f32 / 2.0;
        let center_y = height as f32 / 2.0;
        let radius = (width.min(height) as f32 / 3.0).max(2.0);

        Array4::from_shape_fn((batch_size, 1, height, width), |(_, _, y, x)| {
            let dx = x as f32 - center_x;
            let dy = y as f32 - center_y;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance >= radius {
                0.0
            } else if self.hard_edge {
                1.0
            } else {
                ((radius - distance) / radius).clamp(0.0, 1.0)
            }
        })
    }

    fn run(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if !self.initialized {
            return Err(BgRemovalError::inference("Mock backend not initialized"));
        }
        if self.should_fail_inference {
            return Err(BgRemovalError::inference("Mock backend inference failed"));
        }

        let (n, c, h, w) = input.dim();
        let (_, expected_c, expected_h, expected_w) = self.model_info.input_shape;
        if (c, h, w) != (expected_c, expected_h, expected_w) {
            return Err(BgRemovalError::inference(format!(
                "Unexpected input shape {:?}",
                input.dim()
            )));
        }

        Ok(self.generate_mock_output(n))
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for MockBackend {
    fn initialize(&mut self, _config: &BackendConfig) -> Result<Option<Duration>> {
        if self.should_fail_init {
            return Err(BgRemovalError::model("Mock backend initialization failed"));
        }

        self.initialized = true;
        Ok(Some(Duration::from_millis(5)))
    }

    fn infer(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        self.counters.enter();
        let result = self.run(input);
        self.counters.leave();
        result
    }

    fn input_shape(&self) -> (usize, usize, usize, usize) {
        self.model_info.input_shape
    }

    fn output_shape(&self) -> (usize, usize, usize, usize) {
        self.model_info.output_shape
    }

    fn get_preprocessing_config(&self) -> Result<PreprocessingConfig> {
        Ok(self.preprocessing_config.clone())
    }

    fn get_model_info(&self) -> Result<ModelInfo> {
        Ok(self.model_info.clone())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_reentrant(&self) -> bool {
        self.reentrant
    }
}
