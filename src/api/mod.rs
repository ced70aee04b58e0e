//! HTTP API: shared state, routing and middleware

pub mod auth;
pub mod handlers;
pub mod metrics;
pub mod upload;

use crate::{
    config::ServiceConfig,
    error::Result,
    gate::ConcurrencyGate,
    services::{ImageCodecAdapter, UploadValidator},
    session::{DefaultSessionLoader, SessionHolder, SessionLoader},
};
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

pub use auth::AuthLayer;
pub use metrics::{MetricsSnapshot, ServiceMetrics};

/// State shared by every handler
#[derive(Debug)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub sessions: Arc<SessionHolder>,
    pub codec: ImageCodecAdapter,
    pub validator: UploadValidator,
    pub metrics: ServiceMetrics,
    pub started_at: Instant,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Build state around an explicit session loader
    #[must_use]
    pub fn new(config: ServiceConfig, loader: Arc<dyn SessionLoader>) -> Self {
        let gate = ConcurrencyGate::new(config.max_concurrent_requests, config.gate_timeout());
        let sessions = SessionHolder::new(
            config.rembg_model.clone(),
            config.inference_backend.to_string(),
            gate.capacity(),
            loader,
        );

        Self {
            validator: UploadValidator::from_config(&config),
            codec: ImageCodecAdapter::new(gate),
            sessions: Arc::new(sessions),
            config: Arc::new(config),
            metrics: ServiceMetrics::new(),
            started_at: Instant::now(),
        }
    }

    /// Build state with the registry-backed loader
    ///
    /// # Errors
    /// - Invalid model download URL
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        let loader = DefaultSessionLoader::from_config(&config)?;
        Ok(Self::new(config, Arc::new(loader)))
    }

    #[must_use]
    pub fn gate(&self) -> &ConcurrencyGate {
        self.codec.gate()
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(handlers::REQUEST_ID_HEADER),
            HeaderName::from_static("x-processing-model"),
            HeaderName::from_static("x-input-size"),
            HeaderName::from_static("x-output-size"),
            HeaderName::from_static("x-processing-time-ms"),
            HeaderName::from_static("x-files-processed"),
            HeaderName::from_static("x-files-failed"),
        ]);

    if allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Build the application router
pub fn create_router(state: SharedState) -> Router {
    let protected = Router::new()
        .route("/remove", post(handlers::remove_background))
        .route("/batch", post(handlers::remove_background_batch))
        .route("/metrics", get(handlers::metrics))
        .route_layer(AuthLayer::new(state.config.api_key.clone()));

    let open = Router::new()
        .route("/health", get(handlers::health))
        .route("/info", get(handlers::info));

    Router::new()
        .route("/", get(handlers::root))
        .nest("/api/v1", protected.merge(open))
        .layer(DefaultBodyLimit::max(state.config.body_limit()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.allowed_origins))
        .with_state(state)
}
