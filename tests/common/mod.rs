//! Shared fixtures for the HTTP integration tests
//!
//! The session loader builds the library mock backend, so integration tests
//! and unit tests count segmentation calls the same way.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use imgly_bgremove_server::{
    api,
    backends::test_utils::{InferenceCounters, MockBackend},
    config::BackendConfig,
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
    models::OutputActivation,
    session::{ModelSession, SessionLoader},
    AppState, ServiceConfig, SharedState,
};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const BOUNDARY: &str = "bgremove-test-boundary-7MA4YWxkTrZu0gW";

/// Behaviour of the mock model
#[derive(Debug, Clone)]
pub struct MockOptions {
    pub size: usize,
    pub fail_load: bool,
    pub fail_inference: bool,
    pub delay: Duration,
    pub preload: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            size: 16,
            fail_load: false,
            fail_inference: false,
            delay: Duration::ZERO,
            preload: true,
        }
    }
}

/// Session loader that builds hard-edged [`MockBackend`] sessions
pub struct MockLoader {
    options: MockOptions,
    counters: Arc<InferenceCounters>,
    loads: Arc<AtomicUsize>,
}

impl MockLoader {
    fn backend(&self) -> MockBackend {
        let backend = MockBackend::with_size(self.options.size)
            .with_hard_edge()
            .with_delay(self.options.delay)
            .with_counters(Arc::clone(&self.counters));
        if self.options.fail_inference {
            backend.failing_inference()
        } else {
            backend
        }
    }
}

#[async_trait]
impl SessionLoader for MockLoader {
    async fn load(&self, model_name: &str) -> Result<ModelSession> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.options.fail_load {
            return Err(BgRemovalError::model("mock weights are missing"));
        }

        let mut backend = self.backend();
        backend.initialize(&BackendConfig::default())?;
        ModelSession::new(
            model_name,
            Box::new(backend),
            OutputActivation::None,
            Duration::from_millis(1),
        )
    }
}

/// Configuration used by most tests
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        rembg_model: "mock-model".to_string(),
        max_file_size: 1024 * 1024,
        max_files_batch: 5,
        max_concurrent_requests: 2,
        request_timeout: 30,
        ..ServiceConfig::default()
    }
}

/// Router plus handles to its state and mock model
pub struct TestServer {
    pub state: SharedState,
    pub router: Router,
    counters: Arc<InferenceCounters>,
    loads: Arc<AtomicUsize>,
}

/// Collected response
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl TestServer {
    pub async fn start(config: ServiceConfig, options: MockOptions) -> Self {
        let counters = Arc::new(InferenceCounters::default());
        let loads = Arc::new(AtomicUsize::new(0));
        let preload = options.preload;
        let loader = MockLoader {
            options,
            counters: Arc::clone(&counters),
            loads: Arc::clone(&loads),
        };

        let state = Arc::new(AppState::new(config, Arc::new(loader)));
        if preload {
            let _ = state.sessions.preload().await;
        }
        let router = api::create_router(Arc::clone(&state));

        Self {
            state,
            router,
            counters,
            loads,
        }
    }

    /// Segmentation calls that reached the model
    pub fn calls(&self) -> usize {
        self.counters.calls()
    }

    /// Most segmentation calls that ran at once
    pub fn peak(&self) -> usize {
        self.counters.peak()
    }

    /// Model loads requested from the loader
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub async fn default() -> Self {
        Self::start(test_config(), MockOptions::default()).await
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");

        let status = response.status();
        let headers = response.headers().clone();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body can be collected");

        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post_multipart(&self, uri: &str, body: MultipartBody) -> TestResponse {
        self.send(body.into_request(uri)).await
    }
}

/// Hand-built `multipart/form-data` body
#[derive(Debug, Default)]
pub struct MultipartBody {
    buffer: Vec<u8>,
}

impl MultipartBody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, field: &str, filename: &str, content_type: &str, bytes: &[u8]) -> Self {
        self.buffer.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        self.buffer.extend_from_slice(bytes);
        self.buffer.extend_from_slice(b"\r\n");
        self
    }

    pub fn text(mut self, field: &str, value: &str) -> Self {
        self.buffer.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
        self
    }

    pub fn build(mut self) -> Vec<u8> {
        self.buffer
            .extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.buffer
    }

    pub fn into_request(self, uri: &str) -> Request<Body> {
        self.into_request_with_headers(uri, &[])
    }

    pub fn into_request_with_headers(self, uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
        let mut builder = Request::post(uri).header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        );
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Body::from(self.build())).unwrap()
    }
}

fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    image.write_to(&mut cursor, format).unwrap();
    cursor.into_inner()
}

/// Opaque JPEG with a gradient so encoders have something to work with
pub fn jpeg_image(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    encode(DynamicImage::ImageRgb8(image), ImageFormat::Jpeg)
}

pub fn png_image(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba([30, 60, 90, 255]));
    encode(DynamicImage::ImageRgba8(image), ImageFormat::Png)
}

pub fn corrupt_bytes() -> Vec<u8> {
    b"\xFF\xD8\xFF\xE0 this is not really a jpeg".to_vec()
}

/// Single-file form for `/api/v1/remove`
pub fn single_upload(filename: &str, bytes: &[u8]) -> MultipartBody {
    MultipartBody::new().file("file", filename, "image/jpeg", bytes)
}
