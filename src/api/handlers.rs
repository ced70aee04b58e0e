//! Endpoint handlers
//!
//! Every response produced here, success or failure, carries the request id
//! in `X-Request-ID`.

use super::{
    upload::{self, UploadLimits},
    MetricsSnapshot, SharedState,
};
use crate::{
    config::{OutputFormat, MAX_OUTPUT_DIMENSION},
    error::{BgRemovalError, Result},
    gate::GateStats,
    models,
    services::{
        output_filename, BatchArchive, BatchItemOutcome, ProcessingRequest, RawOutputParams,
    },
    tracing_config::{events, spans},
};
use axum::{
    extract::{multipart::MultipartRejection, rejection::QueryRejection, Multipart, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::Instrument;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const API_VERSION: &str = "1.0.0";

/// Error response tagged with the request it belongs to
#[derive(Debug)]
pub struct ApiError {
    pub request_id: String,
    pub error: BgRemovalError,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = self.error.into_response();
        insert_header(response.headers_mut(), REQUEST_ID_HEADER, &self.request_id);
        response
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(HeaderName::from_static(name), value);
        },
        Err(_) => tracing::debug!(header = name, "Skipping header with invalid value"),
    }
}

fn query_params(query: std::result::Result<Query<RawOutputParams>, QueryRejection>) -> Result<RawOutputParams> {
    query
        .map(|Query(params)| params)
        .map_err(|e| BgRemovalError::bad_request(format!("Invalid query string: {}", e.body_text())))
}

/// Log a failed request and turn it into a response
fn fail(state: &SharedState, request_id: String, error: BgRemovalError) -> Response {
    state.metrics.record_request_failure();
    if error.is_client_error() {
        tracing::warn!(request_id = %request_id, status = %error.status_code(), error = %error, "Request rejected");
    } else {
        events::error_with_context(&error, &format!("request {request_id}"));
    }
    ApiError { request_id, error }.into_response()
}

/// `POST /api/v1/remove`
pub async fn remove_background(
    State(state): State<SharedState>,
    query: std::result::Result<Query<RawOutputParams>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let request_id = new_request_id();
    state.metrics.record_request();

    let span = spans::request(&request_id, "remove");
    match process_single(&state, &request_id, query, multipart)
        .instrument(span)
        .await
    {
        Ok(response) => response,
        Err(error) => fail(&state, request_id, error),
    }
}

async fn process_single(
    state: &SharedState,
    request_id: &str,
    query: std::result::Result<Query<RawOutputParams>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Response> {
    let query = query_params(query)?;
    let multipart = multipart.map_err(|e| upload::rejection_error(&e))?;

    let limits = UploadLimits {
        file_fields: &["file"],
        max_files: 1,
        fail_fast: true,
    };
    let form = upload::read_form(multipart, limits, &state.validator).await?;
    let file = form.files.into_iter().next().ok_or_else(|| {
        BgRemovalError::bad_request("No file uploaded. Expected a multipart field named 'file'")
    })?;
    let image_bytes = file.data?;
    let options = state.validator.validate_params(&query.merged_with(form.params))?;

    let session = state.sessions.default_session().await?;
    tracing::info!(
        filename = %file.filename,
        size = image_bytes.len(),
        format = %options.format,
        "Processing image"
    );

    let request = ProcessingRequest {
        image_bytes,
        content_type: file.content_type,
        filename: file.filename.clone(),
        output_format: options.format,
        quality: options.quality,
        output_dimensions: options.dimensions,
    };
    let result = match state.codec.process(request, session).await {
        Ok(result) => result,
        Err(e) => {
            state.metrics.record_image_failure();
            return Err(e);
        },
    };
    state
        .metrics
        .record_image_success(result.input_size, result.output_size);

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "content-type", result.content_type);
    insert_header(
        &mut headers,
        "content-disposition",
        &format!(
            "attachment; filename={}",
            output_filename(&file.filename, result.output_format)
        ),
    );
    insert_header(&mut headers, REQUEST_ID_HEADER, request_id);
    insert_header(&mut headers, "x-processing-model", &result.model);
    insert_header(&mut headers, "x-input-size", &result.input_size.to_string());
    insert_header(&mut headers, "x-output-size", &result.output_size.to_string());
    insert_header(
        &mut headers,
        "x-processing-time-ms",
        &result.elapsed_ms().to_string(),
    );

    tracing::info!(
        output_size = result.output_size,
        elapsed_ms = result.elapsed_ms(),
        "Successfully processed image"
    );
    Ok((StatusCode::OK, headers, result.bytes).into_response())
}

/// `POST /api/v1/batch`
pub async fn remove_background_batch(
    State(state): State<SharedState>,
    query: std::result::Result<Query<RawOutputParams>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    let request_id = new_request_id();
    state.metrics.record_request();
    state.metrics.record_batch();

    let span = spans::request(&request_id, "batch");
    match process_batch(&state, &request_id, query, multipart)
        .instrument(span)
        .await
    {
        Ok(response) => response,
        Err(error) => fail(&state, request_id, error),
    }
}

async fn process_batch(
    state: &SharedState,
    request_id: &str,
    query: std::result::Result<Query<RawOutputParams>, QueryRejection>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Response> {
    let query = query_params(query)?;
    let multipart = multipart.map_err(|e| upload::rejection_error(&e))?;

    let limits = UploadLimits {
        file_fields: &["files", "files[]"],
        max_files: state.config.max_files_batch,
        fail_fast: false,
    };
    let form = upload::read_form(multipart, limits, &state.validator).await?;
    if form.files.is_empty() {
        return Err(BgRemovalError::bad_request(
            "No files provided. Expected one or more multipart fields named 'files'",
        ));
    }
    let options = state.validator.validate_params(&query.merged_with(form.params))?;
    let session = state.sessions.default_session().await?;
    let model = session.name().to_string();
    let file_count = form.files.len();

    let pipelines = form.files.into_iter().enumerate().map(|(index, file)| {
        let codec = state.codec.clone();
        let session = Arc::clone(&session);
        async move {
            let bytes = match file.data {
                Ok(bytes) => bytes,
                Err(e) => return BatchItemOutcome::failed(index, file.filename, &e),
            };
            let request = ProcessingRequest {
                image_bytes: bytes,
                content_type: file.content_type,
                filename: file.filename.clone(),
                output_format: options.format,
                quality: options.quality,
                output_dimensions: options.dimensions,
            };
            match codec.process(request, session).await {
                Ok(result) => BatchItemOutcome::succeeded(index, file.filename, result),
                Err(e) => {
                    tracing::warn!(index, filename = %file.filename, error = %e, "Batch item failed");
                    BatchItemOutcome::failed(index, file.filename, &e)
                },
            }
        }
    });
    let outcomes = futures::future::join_all(pipelines)
        .instrument(spans::batch_processing(file_count))
        .await;

    let processed = outcomes.iter().filter(|o| o.success).count();
    let failed = outcomes.len() - processed;
    for outcome in &outcomes {
        match &outcome.result {
            Some(result) => state
                .metrics
                .record_image_success(result.input_size, result.output_size),
            None => state.metrics.record_image_failure(),
        }
    }

    if processed == 0 {
        let summary = outcomes
            .iter()
            .map(|o| format!("{}: {}", o.filename, o.error.as_deref().unwrap_or("unknown error")))
            .collect::<Vec<_>>()
            .join("; ");
        let detail = format!("All {failed} files failed: {summary}");
        return Err(if outcomes.iter().all(BatchItemOutcome::is_client_failure) {
            BgRemovalError::BatchRejected(detail)
        } else {
            BgRemovalError::processing(detail)
        });
    }

    let archive = BatchArchive::new(request_id, model.clone(), options.format);
    let zip_bytes = tokio::task::spawn_blocking(move || archive.build(&outcomes))
        .await
        .map_err(|e| BgRemovalError::internal(format!("Archive worker failed: {e}")))??;

    let short_id = request_id.get(..8).unwrap_or(request_id);
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "content-type", "application/zip");
    insert_header(
        &mut headers,
        "content-disposition",
        &format!("attachment; filename=batch_no_bg_{short_id}.zip"),
    );
    insert_header(&mut headers, REQUEST_ID_HEADER, request_id);
    insert_header(&mut headers, "x-files-processed", &processed.to_string());
    insert_header(&mut headers, "x-files-failed", &failed.to_string());
    insert_header(&mut headers, "x-processing-model", &model);

    tracing::info!(processed, failed, "Successfully processed batch");
    Ok((StatusCode::OK, headers, zip_bytes).into_response())
}

/// Health report body
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model: String,
    pub model_loaded: bool,
    pub last_error: Option<String>,
    pub load_time_ms: Option<u64>,
    pub backend: String,
    pub gate: GateStats,
    pub uptime_seconds: u64,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// `GET /api/v1/health`; never loads the model and never waits on the gate
pub async fn health(State(state): State<SharedState>) -> Response {
    let model = state.sessions.default_model().to_string();
    let session = state.sessions.loaded_session(&model);
    let model_loaded = session.is_some();

    let body = HealthResponse {
        status: if model_loaded { "healthy" } else { "unhealthy" },
        last_error: state.sessions.last_error(&model),
        load_time_ms: session
            .as_ref()
            .map(|s| u64::try_from(s.load_time().as_millis()).unwrap_or(u64::MAX)),
        model,
        model_loaded,
        backend: state.config.inference_backend.to_string(),
        gate: state.gate().stats(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    };

    let status = if model_loaded {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

/// `GET /api/v1/info`
pub async fn info(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let config = &state.config;
    Json(json!({
        "api_version": API_VERSION,
        "current_model": config.rembg_model,
        "configuration": {
            "max_file_size": config.max_file_size,
            "max_file_size_mb": config.max_file_size as f64 / (1024.0 * 1024.0),
            "max_files_batch": config.max_files_batch,
            "allowed_extensions": config.allowed_extensions,
            "supported_output_formats": OutputFormat::ALL.map(OutputFormat::as_str),
            "default_output_format": config.default_output_format,
            "default_quality": config.output_quality,
            "max_output_dimension": MAX_OUTPUT_DIMENSION,
            "max_concurrent_requests": state.gate().capacity(),
            "request_timeout_seconds": config.request_timeout,
            "inference_backend": config.inference_backend.to_string(),
        },
        "features": {
            "single_image_processing": true,
            "batch_processing": true,
            "multiple_output_formats": true,
            "quality_control": true,
            "output_resize": true,
            "api_key_required": config.api_key.is_some(),
            "model_download": config.model_download,
        },
        "available_models": models::available_models(),
    }))
}

/// Metrics report body
#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub gate: GateStats,
    pub model_loaded: bool,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

/// `GET /api/v1/metrics`
pub async fn metrics(State(state): State<SharedState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        counters: state.metrics.snapshot(),
        gate: state.gate().stats(),
        model_loaded: state.sessions.is_loaded(state.sessions.default_model()),
        uptime_seconds: state.uptime_seconds(),
        timestamp: Utc::now(),
    })
}

/// `GET /`
pub async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Background Remover API",
        "version": env!("CARGO_PKG_VERSION"),
        "docs": "/api/v1/info",
    }))
}
