#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

//! # IMG.LY Background Removal Server
//!
//! An HTTP service that removes image backgrounds with the rembg family of
//! segmentation models, executed by Tract (pure Rust) or ONNX Runtime.
//!
//! ## Features
//!
//! - **Single and batch endpoints**: `POST /api/v1/remove` returns the cut-out,
//!   `POST /api/v1/batch` returns a zip archive with a `manifest.json`
//! - **Output formats**: PNG and WEBP with transparency, JPEG flattened onto white
//! - **Bounded concurrency**: a FIFO [`ConcurrencyGate`] caps simultaneous
//!   segmentation calls independently of HTTP connection handling
//! - **Lazy model sessions**: one shared [`ModelSession`] per model, created on
//!   first use or at startup, with automatic model download and caching
//! - **Health, info and metrics** endpoints
//!
//! ## Embedding the router
//!
//! ```rust,no_run
//! use imgly_bgremove_server::{api, AppState, ServiceConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ServiceConfig::from_env()?;
//! let address = config.bind_address();
//! let state = Arc::new(AppState::from_config(config)?);
//! let app = api::create_router(Arc::clone(&state));
//!
//! let listener = tokio::net::TcpListener::bind(address).await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `tract` (default): Pure Rust backend
//! - `onnx`: ONNX Runtime backend with CUDA and `CoreML` execution providers

pub mod api;
pub mod backends;
pub mod config;
pub mod download;
pub mod error;
pub mod gate;
pub mod inference;
pub mod models;
pub mod services;
pub mod session;
pub mod tracing_config;
pub mod utils;

// Public API exports
pub use api::{create_router, AppState, SharedState};
pub use backends::*;
pub use config::{BackendConfig, BackendType, ExecutionProvider, OutputFormat, ServiceConfig};
pub use download::{validate_model_url, verify_file_integrity, ModelDownloader};
pub use error::{BgRemovalError, ErrorBody, Result};
pub use gate::{ConcurrencyGate, GatePermit, GateStats};
pub use inference::{BackendFactory, DefaultBackendFactory, InferenceBackend};
pub use models::{ModelDescriptor, ModelInfo, ModelSource, ModelSpec, OutputActivation};
pub use services::{
    BatchArchive, BatchItemOutcome, ImageCodecAdapter, OutputDimensions, OutputFormatHandler,
    ProcessingRequest, ProcessingResult, UploadValidator,
};
pub use session::{DefaultSessionLoader, ModelSession, SessionHolder, SessionLoader};
pub use tracing_config::{events, spans, TracingConfig, TracingFormat};
pub use utils::{ImagePostprocessor, ImagePreprocessor, Segmentation};
