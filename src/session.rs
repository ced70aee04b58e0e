//! Loaded model sessions and their lazy, shared initialization
//!
//! A [`ModelSession`] owns one initialized inference backend together with the
//! pre/post-processing parameters of its model. The [`SessionHolder`] creates at
//! most one session per model name: concurrent first requests share a single
//! initialization and all observe the same session or the same failure. A failed
//! initialization is forgotten once reported, so the next request tries again.

use crate::config::{BackendConfig, BackendType, ServiceConfig};
use crate::download::ModelDownloader;
use crate::error::{BgRemovalError, Result};
use crate::inference::{BackendFactory, DefaultBackendFactory, InferenceBackend};
use crate::models::{self, ModelInfo, ModelSpec, OutputActivation, PreprocessingConfig};
use crate::tracing_config::{events, spans};
use crate::utils::{ImagePostprocessor, ImagePreprocessor, Segmentation};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use image::DynamicImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::Instrument;

/// One initialized model, shared read-only between requests
pub struct ModelSession {
    name: String,
    backend: Box<dyn InferenceBackend>,
    model_info: ModelInfo,
    preprocessing: PreprocessingConfig,
    activation: OutputActivation,
    load_time: Duration,
}

impl std::fmt::Debug for ModelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSession")
            .field("name", &self.name)
            .field("model_info", &self.model_info)
            .field("activation", &self.activation)
            .field("load_time", &self.load_time)
            .finish_non_exhaustive()
    }
}

impl ModelSession {
    /// Wrap an already initialized backend
    ///
    /// # Errors
    /// - Backend not initialized
    /// - Backend cannot report its model metadata
    pub fn new(
        name: impl Into<String>,
        backend: Box<dyn InferenceBackend>,
        activation: OutputActivation,
        load_time: Duration,
    ) -> Result<Self> {
        if !backend.is_initialized() {
            return Err(BgRemovalError::model("Backend must be initialized before use"));
        }

        let model_info = backend.get_model_info()?;
        let preprocessing = backend.get_preprocessing_config()?;

        Ok(Self {
            name: name.into(),
            backend,
            model_info,
            preprocessing,
            activation,
            load_time,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn model_info(&self) -> &ModelInfo {
        &self.model_info
    }

    #[must_use]
    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    #[must_use]
    pub fn is_reentrant(&self) -> bool {
        self.backend.is_reentrant()
    }

    /// Segment the foreground of `image`; CPU-bound, call from a blocking worker
    ///
    /// # Errors
    /// - `Inference` when the backend call fails
    /// - `Processing` when the tensors cannot be converted
    pub fn segment(&self, image: &DynamicImage) -> Result<Segmentation> {
        let dimensions = (image.width(), image.height());
        let _span = spans::inference(&self.name, dimensions).entered();

        let started = Instant::now();
        let input = ImagePreprocessor::preprocess_for_inference(image, &self.preprocessing)?;
        let output = self.backend.infer(&input).map_err(|e| match e {
            BgRemovalError::Inference(_) => e,
            other => BgRemovalError::inference(other.to_string()),
        })?;
        let segmentation =
            ImagePostprocessor::tensor_to_segmentation(&output, self.activation, dimensions)?;

        events::performance_metric(
            "segmentation",
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            None,
        );
        Ok(segmentation)
    }
}

/// Produces initialized sessions for model names
#[async_trait]
pub trait SessionLoader: Send + Sync {
    /// Build a ready-to-use session for `model_name`
    ///
    /// # Errors
    /// - Unknown model, missing model file, download or backend failures
    async fn load(&self, model_name: &str) -> Result<ModelSession>;
}

/// Loader backed by the model registry, the downloader and a backend factory
pub struct DefaultSessionLoader {
    downloader: ModelDownloader,
    factory: Arc<dyn BackendFactory>,
    backend_type: BackendType,
    backend_config: BackendConfig,
    default_model: String,
    model_path: Option<PathBuf>,
    model_sha256: Option<String>,
}

impl DefaultSessionLoader {
    /// Create a loader from service configuration using the feature-enabled backends
    ///
    /// # Errors
    /// - Invalid model download URL
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(DefaultBackendFactory))
    }

    /// Create a loader with a custom backend factory
    ///
    /// # Errors
    /// - Invalid model download URL
    pub fn with_factory(config: &ServiceConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let downloader = ModelDownloader::new(
            config.resolved_model_cache_dir(),
            &config.model_base_url,
            config.model_download,
        )?;

        Ok(Self {
            downloader,
            factory,
            backend_type: config.inference_backend,
            backend_config: config.backend_config(),
            default_model: config.rembg_model.clone(),
            model_path: config.model_path.clone(),
            model_sha256: config.model_sha256.clone(),
        })
    }

    async fn resolve_model_file(&self, descriptor: &models::ModelDescriptor) -> Result<PathBuf> {
        match &self.model_path {
            Some(path) if descriptor.name == self.default_model => {
                if path.is_file() {
                    Ok(path.clone())
                } else {
                    Err(BgRemovalError::model(format!(
                        "Model file '{}' does not exist",
                        path.display()
                    )))
                }
            },
            _ => {
                self.downloader
                    .ensure_model(descriptor, self.model_sha256.as_deref())
                    .await
            },
        }
    }
}

#[async_trait]
impl SessionLoader for DefaultSessionLoader {
    async fn load(&self, model_name: &str) -> Result<ModelSession> {
        let descriptor = models::lookup(model_name)?;
        let path = self.resolve_model_file(descriptor).await?;
        let spec = ModelSpec::from_descriptor(descriptor, path);

        let factory = Arc::clone(&self.factory);
        let backend_type = self.backend_type;
        let backend_config = self.backend_config.clone();
        let name = model_name.to_string();

        tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let mut backend = factory.create_backend(backend_type, spec)?;
            backend.initialize(&backend_config)?;
            ModelSession::new(name, backend, descriptor.activation, started.elapsed())
        })
        .await
        .map_err(|e| BgRemovalError::internal(format!("Model loading task failed: {e}")))?
    }
}

type InitOutcome = std::result::Result<Arc<ModelSession>, String>;
type SessionInit = Shared<BoxFuture<'static, InitOutcome>>;

/// Owns one lazily created session per model name
///
/// Initialization runs on a detached task; callers only await its shared
/// outcome, so a caller that goes away mid-load neither aborts the load nor
/// lets the next caller start a second one.
pub struct SessionHolder {
    default_model: String,
    backend_label: String,
    gate_width: usize,
    loader: Arc<dyn SessionLoader>,
    pending: Mutex<HashMap<String, Arc<SessionInit>>>,
    ready: Arc<Mutex<HashMap<String, Arc<ModelSession>>>>,
    last_errors: Arc<Mutex<HashMap<String, String>>>,
}

impl std::fmt::Debug for SessionHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHolder")
            .field("default_model", &self.default_model)
            .field("backend", &self.backend_label)
            .field("models", &self.ready.lock().keys().cloned().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SessionHolder {
    #[must_use]
    pub fn new(
        default_model: impl Into<String>,
        backend_label: impl Into<String>,
        gate_width: usize,
        loader: Arc<dyn SessionLoader>,
    ) -> Self {
        Self {
            default_model: default_model.into(),
            backend_label: backend_label.into(),
            gate_width,
            loader,
            pending: Mutex::new(HashMap::new()),
            ready: Arc::new(Mutex::new(HashMap::new())),
            last_errors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Shared session for `model_name`, initializing it on first use
    ///
    /// # Errors
    /// - `BackendUnavailable` when initialization failed (for this caller and all
    ///   callers that waited on the same attempt)
    pub async fn get_session(&self, model_name: &str) -> Result<Arc<ModelSession>> {
        if let Some(session) = self.loaded_session(model_name) {
            return Ok(session);
        }

        let init = {
            let mut pending = self.pending.lock();
            Arc::clone(
                pending
                    .entry(model_name.to_string())
                    .or_insert_with(|| Arc::new(self.spawn_initialization(model_name))),
            )
        };

        match (*init).clone().await {
            Ok(session) => Ok(session),
            Err(message) => {
                {
                    let mut pending = self.pending.lock();
                    if pending
                        .get(model_name)
                        .is_some_and(|current| Arc::ptr_eq(current, &init))
                    {
                        pending.remove(model_name);
                    }
                }
                Err(BgRemovalError::backend_unavailable(format!(
                    "Model '{model_name}' is not available: {message}"
                )))
            },
        }
    }

    fn spawn_initialization(&self, model_name: &str) -> SessionInit {
        let span = spans::model_loading(model_name, &self.backend_label);
        let task = tokio::spawn(
            initialize(
                Arc::clone(&self.loader),
                model_name.to_string(),
                self.gate_width,
                Arc::clone(&self.ready),
                Arc::clone(&self.last_errors),
            )
            .instrument(span),
        );

        async move {
            task.await
                .unwrap_or_else(|e| Err(format!("Model loading task failed: {e}")))
        }
        .boxed()
        .shared()
    }

    /// Session for the configured default model
    ///
    /// # Errors
    /// - See [`SessionHolder::get_session`]
    pub async fn default_session(&self) -> Result<Arc<ModelSession>> {
        self.get_session(&self.default_model).await
    }

    /// Eagerly initialize the default model
    ///
    /// # Errors
    /// - See [`SessionHolder::get_session`]
    pub async fn preload(&self) -> Result<()> {
        self.default_session().await.map(|_| ())
    }

    /// Already loaded session, without triggering or waiting for initialization
    #[must_use]
    pub fn loaded_session(&self, model_name: &str) -> Option<Arc<ModelSession>> {
        self.ready.lock().get(model_name).cloned()
    }

    #[must_use]
    pub fn is_loaded(&self, model_name: &str) -> bool {
        self.loaded_session(model_name).is_some()
    }

    /// Most recent initialization failure for `model_name`, cleared on success
    #[must_use]
    pub fn last_error(&self, model_name: &str) -> Option<String> {
        self.last_errors.lock().get(model_name).cloned()
    }
}

async fn initialize(
    loader: Arc<dyn SessionLoader>,
    model_name: String,
    gate_width: usize,
    ready: Arc<Mutex<HashMap<String, Arc<ModelSession>>>>,
    last_errors: Arc<Mutex<HashMap<String, String>>>,
) -> InitOutcome {
    match loader.load(&model_name).await {
        Ok(session) => {
            tracing::info!(
                model = %model_name,
                load_ms = %session.load_time().as_millis(),
                "Model session ready"
            );
            if !session.is_reentrant() && gate_width > 1 {
                events::warning_with_recommendation(
                    &format!(
                        "Backend for '{model_name}' serializes inference but MAX_CONCURRENT_REQUESTS is {gate_width}"
                    ),
                    "Set MAX_CONCURRENT_REQUESTS=1 or use the tract backend",
                );
            }
            let session = Arc::new(session);
            last_errors.lock().remove(&model_name);
            ready.lock().insert(model_name, Arc::clone(&session));
            Ok(session)
        },
        Err(e) => {
            events::error_with_context(&e, &format!("loading model '{model_name}'"));
            let message = e.to_string();
            last_errors.lock().insert(model_name, message.clone());
            Err(message)
        },
    }
}
