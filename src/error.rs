//! Error types for background removal operations

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for background removal operations
pub type Result<T> = std::result::Result<T, BgRemovalError>;

/// Comprehensive error types for background removal operations
#[derive(Error, Debug)]
pub enum BgRemovalError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Uploaded file has a type or extension the service does not accept
    #[error("{0}")]
    UnsupportedMediaType(String),

    /// Uploaded file exceeds the configured size limit
    #[error("{0}")]
    PayloadTooLarge(String),

    /// A request parameter is present but malformed or out of range
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The request as a whole is malformed (missing file, too many files, ...)
    #[error("{0}")]
    BadRequest(String),

    /// Every file of a batch was rejected for client-side reasons
    #[error("{0}")]
    BatchRejected(String),

    /// Missing or wrong API key
    #[error("{0}")]
    Unauthorized(String),

    /// Input bytes are not a decodable image
    #[error("Failed to decode image: {0}")]
    Decode(String),

    /// Unsupported output format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Re-encoding the processed image failed
    #[error("Failed to encode image: {0}")]
    Encode(String),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Model cannot be initialized or no capacity can be obtained
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Model loading or initialization errors
    #[error("Model error: {0}")]
    Model(String),

    /// Model download errors
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Memory allocation or processing errors
    #[error("Processing error: {0}")]
    Processing(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BgRemovalError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new unsupported format error
    pub fn unsupported_format<S: Into<String>>(format: S) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Create a new unsupported media type error
    pub fn unsupported_media_type<S: Into<String>>(msg: S) -> Self {
        Self::UnsupportedMediaType(msg.into())
    }

    /// Create a new invalid parameter error
    pub fn invalid_parameter<S: Into<String>>(msg: S) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a new bad request error
    pub fn bad_request<S: Into<String>>(msg: S) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new encode error
    pub fn encode<S: Into<String>>(msg: S) -> Self {
        Self::Encode(msg.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new backend-unavailable error
    pub fn backend_unavailable<S: Into<String>>(msg: S) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a payload-too-large error for an upload
    pub fn payload_too_large(size: usize, limit: usize) -> Self {
        Self::PayloadTooLarge(format!(
            "File size ({size} bytes) exceeds maximum allowed size ({limit} bytes)"
        ))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create network error with operation context
    pub fn network_error<S: Into<String>, E: std::fmt::Display>(context: S, error: E) -> Self {
        Self::Network(format!("{}: {error}", context.into()))
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {rec}"),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range}).{recommendation}"
        ))
    }

    /// HTTP status this error maps to at the API boundary
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnsupportedMediaType(_)
            | Self::BadRequest(_)
            | Self::Decode(_)
            | Self::UnsupportedFormat(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidParameter(_) | Self::BatchRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BackendUnavailable(_) | Self::Model(_) | Self::Network(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            },
            Self::Io(_)
            | Self::Encode(_)
            | Self::Inference(_)
            | Self::InvalidConfig(_)
            | Self::Processing(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error was caused by the client's input rather than the service
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

impl From<::config::ConfigError> for BgRemovalError {
    fn from(error: ::config::ConfigError) -> Self {
        Self::InvalidConfig(error.to_string())
    }
}

/// JSON error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
    pub status_code: u16,
}

impl ErrorBody {
    #[must_use]
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
            status_code: status.as_u16(),
        }
    }
}

impl IntoResponse for BgRemovalError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(ErrorBody::new(status, self.to_string()))).into_response()
    }
}
