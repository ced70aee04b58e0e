//! Service configuration and output format types

use crate::error::{BgRemovalError, Result};
use ::config::{Config, Environment, Map};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Largest width or height accepted for an explicit output resize
pub const MAX_OUTPUT_DIMENSION: u32 = 10_000;

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon GPU acceleration
    #[serde(rename = "coreml")]
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

/// Output image format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE", try_from = "String")]
pub enum OutputFormat {
    /// PNG with alpha channel transparency
    #[default]
    Png,
    /// JPEG (no transparency, flattened onto white)
    Jpeg,
    /// WebP with alpha channel transparency
    WebP,
}

impl OutputFormat {
    /// All formats the service can produce
    pub const ALL: [OutputFormat; 3] = [Self::Png, Self::Jpeg, Self::WebP];

    /// Canonical upper-case name (`PNG`, `JPEG`, `WEBP`)
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "PNG",
            Self::Jpeg => "JPEG",
            Self::WebP => "WEBP",
        }
    }

    /// MIME type of encoded output
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::WebP => "image/webp",
        }
    }

    /// File extension (without the dot)
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::WebP => "webp",
        }
    }

    /// Check if a format supports transparency (alpha channel)
    #[must_use]
    pub fn supports_transparency(self) -> bool {
        match self {
            Self::Png | Self::WebP => true,
            Self::Jpeg => false,
        }
    }

    /// Whether the encoder honours the quality parameter
    #[must_use]
    pub fn uses_quality(self) -> bool {
        matches!(self, Self::Jpeg | Self::WebP)
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PNG" => Ok(Self::Png),
            "JPEG" | "JPG" => Ok(Self::Jpeg),
            "WEBP" => Ok(Self::WebP),
            other => Err(BgRemovalError::unsupported_format(format!(
                "'{other}' (supported: PNG, JPEG, WEBP)"
            ))),
        }
    }
}

impl TryFrom<String> for OutputFormat {
    type Error = BgRemovalError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Inference engine used to run the segmentation model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Tract backend (pure Rust, no external dependencies)
    #[default]
    Tract,
    /// ONNX Runtime backend (supports GPU acceleration)
    Onnx,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tract => write!(f, "tract"),
            Self::Onnx => write!(f, "onnx"),
        }
    }
}

/// Settings handed to an inference backend when it loads a model
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendConfig {
    /// Execution provider for ONNX Runtime
    pub execution_provider: ExecutionProvider,
    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,
    /// Number of inter-op threads for inference (0 = auto)
    pub inter_threads: usize,
}

/// Complete service configuration, sourced from the environment
///
/// Field names are the lower-cased environment variable names
/// (`MAX_FILE_SIZE` → `max_file_size`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub environment: String,
    pub api_host: String,
    pub api_port: u16,
    pub allowed_origins: Vec<String>,
    pub api_key: Option<String>,

    /// Maximum upload size per file in bytes
    pub max_file_size: usize,
    /// Maximum number of files in one batch request
    pub max_files_batch: usize,
    pub allowed_extensions: Vec<String>,

    /// Segmentation model identifier (rembg naming)
    pub rembg_model: String,
    pub model_cache_dir: Option<PathBuf>,
    /// Explicit model file, bypassing the cache and download
    pub model_path: Option<PathBuf>,
    pub model_download: bool,
    pub model_base_url: String,
    pub model_sha256: Option<String>,
    pub preload_model: bool,

    pub inference_backend: BackendType,
    pub execution_provider: ExecutionProvider,
    pub intra_threads: usize,
    pub inter_threads: usize,

    /// Maximum number of segmentation calls running at once
    pub max_concurrent_requests: usize,
    /// Seconds a request may wait for a concurrency slot
    pub request_timeout: u64,

    pub default_output_format: OutputFormat,
    pub output_quality: u8,

    pub log_level: String,
    pub log_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            environment: "production".to_string(),
            api_host: "0.0.0.0".to_string(),
            api_port: 8000,
            allowed_origins: vec!["*".to_string()],
            api_key: None,
            max_file_size: 10 * 1024 * 1024,
            max_files_batch: 5,
            allowed_extensions: ["jpg", "jpeg", "png", "webp", "bmp"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            rembg_model: "isnet-general-use".to_string(),
            model_cache_dir: None,
            model_path: None,
            model_download: true,
            model_base_url: "https://github.com/danielgatis/rembg/releases/download/v0.0.0"
                .to_string(),
            model_sha256: None,
            preload_model: true,
            inference_backend: BackendType::default(),
            execution_provider: ExecutionProvider::default(),
            intra_threads: 0,
            inter_threads: 0,
            max_concurrent_requests: 4,
            request_timeout: 30,
            default_output_format: OutputFormat::Png,
            output_quality: 95,
            log_level: "info".to_string(),
            log_format: "console".to_string(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the process environment
    ///
    /// # Errors
    /// - Environment values that cannot be parsed into their field types
    /// - Values outside their valid ranges
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load configuration from an explicit variable map instead of the process environment
    ///
    /// # Errors
    /// - Values that cannot be parsed into their field types
    /// - Values outside their valid ranges
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::load(Some(map))
    }

    fn load(source: Option<Map<String, String>>) -> Result<Self> {
        let environment = Environment::default()
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("allowed_extensions")
            .with_list_parse_key("allowed_origins")
            .source(source);

        let config: Self = Config::builder()
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.allowed_extensions = self
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        self.api_key = self.api_key.filter(|key| !key.is_empty());
        self
    }

    /// Validate configuration ranges
    ///
    /// # Errors
    /// - Zero concurrency, batch size or file size
    /// - Output quality outside 1-100
    /// - Empty model name
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(BgRemovalError::config_value_error(
                "MAX_CONCURRENT_REQUESTS",
                0,
                ">= 1",
                Some(4),
            ));
        }
        if self.max_files_batch == 0 {
            return Err(BgRemovalError::config_value_error(
                "MAX_FILES_BATCH",
                0,
                ">= 1",
                Some(5),
            ));
        }
        if self.max_file_size == 0 {
            return Err(BgRemovalError::config_value_error(
                "MAX_FILE_SIZE",
                0,
                ">= 1",
                Some(10 * 1024 * 1024),
            ));
        }
        if !(1..=100).contains(&self.output_quality) {
            return Err(BgRemovalError::config_value_error(
                "OUTPUT_QUALITY",
                self.output_quality,
                "1-100",
                Some(95),
            ));
        }
        if self.rembg_model.trim().is_empty() {
            return Err(BgRemovalError::invalid_config("REMBG_MODEL must not be empty"));
        }
        Ok(())
    }

    /// Directory that holds downloaded model files
    #[must_use]
    pub fn resolved_model_cache_dir(&self) -> PathBuf {
        self.model_cache_dir.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join(".model_cache")
        })
    }

    /// How long a request may queue for a concurrency slot (`None` = forever)
    #[must_use]
    pub fn gate_timeout(&self) -> Option<Duration> {
        (self.request_timeout > 0).then(|| Duration::from_secs(self.request_timeout))
    }

    /// Upper bound for a whole request body
    #[must_use]
    pub fn body_limit(&self) -> usize {
        // Room for every batch file plus multipart framing and text fields
        self.max_file_size
            .saturating_add(64 * 1024)
            .saturating_mul(self.max_files_batch.max(1))
            .saturating_add(1024 * 1024)
    }

    /// Backend settings derived from this configuration
    #[must_use]
    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            execution_provider: self.execution_provider,
            intra_threads: self.intra_threads,
            inter_threads: self.inter_threads,
        }
    }

    /// Address the HTTP server binds to
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}
