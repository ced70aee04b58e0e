//! Streaming multipart upload reader
//!
//! File fields are checked for type as soon as their headers arrive and for
//! size while their chunks stream in, so an oversized upload is rejected
//! without ever being held in memory. Text fields carry output parameters.

use crate::{
    error::{BgRemovalError, Result},
    services::{RawOutputParams, UploadValidator},
};
use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        Multipart,
    },
    http::StatusCode,
};

/// One file field of the form
#[derive(Debug)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: Option<String>,
    /// Bytes of the file, or the reason it was rejected while reading
    pub data: Result<Vec<u8>>,
}

impl UploadedFile {
    /// Size of the accepted payload, 0 when rejected
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.as_ref().map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parsed multipart form
#[derive(Debug, Default)]
pub struct UploadForm {
    pub files: Vec<UploadedFile>,
    pub params: RawOutputParams,
}

/// Which file fields to read and how many of them are allowed
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits<'a> {
    pub file_fields: &'a [&'a str],
    pub max_files: usize,
    /// Abort on the first rejected file instead of recording it
    pub fail_fast: bool,
}

/// Error for a request that is not a readable multipart form
#[must_use]
pub fn rejection_error(rejection: &MultipartRejection) -> BgRemovalError {
    BgRemovalError::bad_request(format!(
        "Expected a multipart/form-data body: {}",
        rejection.body_text()
    ))
}

/// Error for a multipart stream that broke while being read
#[must_use]
pub fn multipart_error(error: &MultipartError) -> BgRemovalError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        BgRemovalError::PayloadTooLarge(format!("Request body too large: {}", error.body_text()))
    } else {
        BgRemovalError::bad_request(format!("Malformed multipart body: {}", error.body_text()))
    }
}

/// Read the whole form, validating file type and size per file
///
/// # Errors
/// - `BadRequest` for a malformed body or more file fields than `max_files`
/// - `PayloadTooLarge` when the request body limit is hit
/// - With `fail_fast`, the first per-file rejection
pub async fn read_form(
    mut multipart: Multipart,
    limits: UploadLimits<'_>,
    validator: &UploadValidator,
) -> Result<UploadForm> {
    let mut form = UploadForm::default();

    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(&e))? {
        let name = field.name().unwrap_or_default().to_string();

        if limits.file_fields.contains(&name.as_str()) {
            if form.files.len() >= limits.max_files {
                return Err(BgRemovalError::bad_request(format!(
                    "Too many files. Maximum allowed: {}",
                    limits.max_files
                )));
            }

            let mut file = read_file(field, form.files.len(), validator).await?;
            if limits.fail_fast {
                file.data = Ok(file.data?);
            }
            form.files.push(file);
        } else if field.file_name().is_none() {
            let value = field.text().await.map_err(|e| multipart_error(&e))?;
            if !form.params.set(&name, value) {
                tracing::debug!(field = %name, "Ignoring unknown form field");
            }
        } else {
            tracing::debug!(field = %name, "Ignoring unexpected file field");
        }
    }

    Ok(form)
}

async fn read_file(
    mut field: Field<'_>,
    position: usize,
    validator: &UploadValidator,
) -> Result<UploadedFile> {
    let filename = field
        .file_name()
        .filter(|n| !n.is_empty())
        .map_or_else(|| format!("image_{}", position + 1), ToString::to_string);
    let content_type = field.content_type().map(ToString::to_string);

    if let Err(e) = validator.validate_file_type(&filename, content_type.as_deref()) {
        return Ok(UploadedFile {
            filename,
            content_type,
            data: Err(e),
        });
    }

    let limit = validator.max_file_size();
    let mut buffer = Vec::new();
    let mut total = 0usize;

    while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(&e))? {
        total = total.saturating_add(chunk.len());
        // Past the limit the rest of the field is only counted
        if total <= limit {
            buffer.extend_from_slice(&chunk);
        } else if !buffer.is_empty() {
            buffer = Vec::new();
        }
    }

    let data = validator.validate_size(total).map(|()| buffer);
    Ok(UploadedFile {
        filename,
        content_type,
        data,
    })
}
