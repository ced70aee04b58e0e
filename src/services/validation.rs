//! Upload and request parameter validation
//!
//! Checks run in a fixed order: file type (400), then size (413), then output
//! parameters (422). Nothing here touches the model.

use crate::{
    config::{OutputFormat, ServiceConfig, MAX_OUTPUT_DIMENSION},
    error::{BgRemovalError, Result},
    services::format::OutputDimensions,
};
use serde::Deserialize;

/// Output parameters as they arrive from a query string or form fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawOutputParams {
    pub output_format: Option<String>,
    pub quality: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
}

impl RawOutputParams {
    /// Field-wise merge where values present in `overrides` win
    #[must_use]
    pub fn merged_with(self, overrides: RawOutputParams) -> Self {
        Self {
            output_format: overrides.output_format.or(self.output_format),
            quality: overrides.quality.or(self.quality),
            width: overrides.width.or(self.width),
            height: overrides.height.or(self.height),
        }
    }

    /// Store a form field; returns `false` for names that are not output parameters
    pub fn set(&mut self, name: &str, value: String) -> bool {
        let slot = match name {
            "output_format" => &mut self.output_format,
            "quality" => &mut self.quality,
            "width" => &mut self.width,
            "height" => &mut self.height,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Validated output parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    pub format: OutputFormat,
    pub quality: u8,
    pub dimensions: Option<OutputDimensions>,
}

/// Validator for uploads against the service limits
#[derive(Debug, Clone)]
pub struct UploadValidator {
    max_file_size: usize,
    allowed_extensions: Vec<String>,
    default_format: OutputFormat,
    default_quality: u8,
}

impl UploadValidator {
    #[must_use]
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            allowed_extensions: config.allowed_extensions.clone(),
            default_format: config.default_output_format,
            default_quality: config.output_quality,
        }
    }

    #[must_use]
    pub fn max_file_size(&self) -> usize {
        self.max_file_size
    }

    /// Extension of `filename`, lower-cased, without the dot
    #[must_use]
    pub fn extension_of(filename: &str) -> Option<String> {
        filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.trim().to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }

    /// Reject files whose extension or declared content type is not an accepted image
    ///
    /// # Errors
    /// - `UnsupportedMediaType` for a missing or disallowed extension
    /// - `UnsupportedMediaType` for a non-image content type
    pub fn validate_file_type(&self, filename: &str, content_type: Option<&str>) -> Result<()> {
        let extension = Self::extension_of(filename).ok_or_else(|| {
            BgRemovalError::unsupported_media_type(format!(
                "File '{filename}' has no extension. Allowed extensions: {}",
                self.allowed_extensions.join(", ")
            ))
        })?;

        if !self.allowed_extensions.iter().any(|allowed| *allowed == extension) {
            return Err(BgRemovalError::unsupported_media_type(format!(
                "File extension '{extension}' not allowed. Allowed extensions: {}",
                self.allowed_extensions.join(", ")
            )));
        }

        if let Some(content_type) = content_type {
            let essence = content_type
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            let acceptable = essence.is_empty()
                || essence.starts_with("image/")
                || essence == "application/octet-stream";
            if !acceptable {
                return Err(BgRemovalError::unsupported_media_type(format!(
                    "Content type '{content_type}' is not an image"
                )));
            }
        }

        Ok(())
    }

    /// # Errors
    /// - `PayloadTooLarge` when `size` exceeds the per-file limit
    pub fn validate_size(&self, size: usize) -> Result<()> {
        if size > self.max_file_size {
            return Err(BgRemovalError::payload_too_large(size, self.max_file_size));
        }
        Ok(())
    }

    /// Parse and range-check output parameters, filling in defaults
    ///
    /// # Errors
    /// - `InvalidParameter` for an unknown format, a quality outside 1-100 or a
    ///   dimension outside 1-10000
    pub fn validate_params(&self, params: &RawOutputParams) -> Result<OutputOptions> {
        let format = match non_empty(params.output_format.as_deref()) {
            Some(value) => value.parse::<OutputFormat>().map_err(|_| {
                BgRemovalError::invalid_parameter(format!(
                    "output_format '{value}' is not supported (supported: PNG, JPEG, WEBP)"
                ))
            })?,
            None => self.default_format,
        };

        let quality = match non_empty(params.quality.as_deref()) {
            Some(value) => {
                parse_in_range("quality", value, 1, 100).and_then(|q| {
                    u8::try_from(q).map_err(|_| BgRemovalError::invalid_parameter("quality"))
                })?
            },
            None => self.default_quality,
        };

        let width = non_empty(params.width.as_deref())
            .map(|value| parse_in_range("width", value, 1, MAX_OUTPUT_DIMENSION))
            .transpose()?;
        let height = non_empty(params.height.as_deref())
            .map(|value| parse_in_range("height", value, 1, MAX_OUTPUT_DIMENSION))
            .transpose()?;

        Ok(OutputOptions {
            format,
            quality,
            dimensions: OutputDimensions::new(width, height),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_in_range(name: &str, value: &str, min: u32, max: u32) -> Result<u32> {
    let parsed: i64 = value.parse().map_err(|_| {
        BgRemovalError::invalid_parameter(format!("{name} must be an integer, got '{value}'"))
    })?;

    if parsed < i64::from(min) || parsed > i64::from(max) {
        return Err(BgRemovalError::invalid_parameter(format!(
            "{name} must be between {min} and {max}, got {parsed}"
        )));
    }
    Ok(parsed as u32)
}
