//! Batch result packaging
//!
//! Successful outputs are stored in a zip archive next to a `manifest.json`
//! that describes every input file, failed ones included, in request order.

use crate::{
    config::OutputFormat,
    error::{BgRemovalError, Result},
    services::codec::{output_filename, ProcessingResult},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MANIFEST_NAME: &str = "manifest.json";

/// Result of one file in a batch
#[derive(Debug, Clone)]
pub struct BatchItemOutcome {
    pub index: usize,
    pub filename: String,
    pub success: bool,
    pub result: Option<ProcessingResult>,
    pub error: Option<String>,
    pub status_code: u16,
}

impl BatchItemOutcome {
    #[must_use]
    pub fn succeeded(index: usize, filename: impl Into<String>, result: ProcessingResult) -> Self {
        Self {
            index,
            filename: filename.into(),
            success: true,
            result: Some(result),
            error: None,
            status_code: 200,
        }
    }

    #[must_use]
    pub fn failed(index: usize, filename: impl Into<String>, error: &BgRemovalError) -> Self {
        Self {
            index,
            filename: filename.into(),
            success: false,
            result: None,
            error: Some(error.to_string()),
            status_code: error.status_code().as_u16(),
        }
    }

    /// Whether the failure was caused by the uploaded file rather than the service
    #[must_use]
    pub fn is_client_failure(&self) -> bool {
        !self.success && (400..500).contains(&self.status_code)
    }
}

/// Per-file manifest entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub index: usize,
    pub filename: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// `manifest.json` contents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub request_id: String,
    pub model: String,
    pub output_format: OutputFormat,
    pub created_at: DateTime<Utc>,
    pub total_files: usize,
    pub processed: usize,
    pub failed: usize,
    pub files: Vec<ManifestEntry>,
}

/// Builds the batch zip archive
#[derive(Debug, Clone)]
pub struct BatchArchive {
    request_id: String,
    model: String,
    output_format: OutputFormat,
}

impl BatchArchive {
    #[must_use]
    pub fn new(request_id: impl Into<String>, model: impl Into<String>, format: OutputFormat) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            output_format: format,
        }
    }

    /// Unique archive entry names for the successful outcomes, in order
    fn entry_names(&self, outcomes: &[BatchItemOutcome]) -> Vec<Option<String>> {
        let mut used = HashSet::from([MANIFEST_NAME.to_string()]);

        outcomes
            .iter()
            .map(|outcome| {
                let result = outcome.result.as_ref()?;
                let name = output_filename(&outcome.filename, result.output_format);
                let name = if used.contains(&name) {
                    let (stem, ext) = name.rsplit_once('.').unwrap_or((name.as_str(), ""));
                    format!("{stem}_{}.{ext}", outcome.index)
                } else {
                    name
                };
                used.insert(name.clone());
                Some(name)
            })
            .collect()
    }

    /// Describe every outcome, assigning archive names to the successful ones
    #[must_use]
    pub fn manifest(&self, outcomes: &[BatchItemOutcome]) -> BatchManifest {
        let names = self.entry_names(outcomes);
        let files: Vec<ManifestEntry> = outcomes
            .iter()
            .zip(names)
            .map(|(outcome, output_filename)| {
                let result = outcome.result.as_ref();
                ManifestEntry {
                    index: outcome.index,
                    filename: outcome.filename.clone(),
                    success: outcome.success,
                    output_filename,
                    error: outcome.error.clone(),
                    status_code: outcome.status_code,
                    input_size: result.map(|r| r.input_size),
                    output_size: result.map(|r| r.output_size),
                    processing_time_ms: result.map(ProcessingResult::elapsed_ms),
                    width: result.map(|r| r.dimensions.0),
                    height: result.map(|r| r.dimensions.1),
                }
            })
            .collect();

        let processed = files.iter().filter(|f| f.success).count();
        BatchManifest {
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            output_format: self.output_format,
            created_at: Utc::now(),
            total_files: files.len(),
            processed,
            failed: files.len() - processed,
            files,
        }
    }

    /// Write the archive: one entry per successful output plus the manifest
    ///
    /// # Errors
    /// - `Internal` when the archive or the manifest cannot be written
    pub fn build(&self, outcomes: &[BatchItemOutcome]) -> Result<Vec<u8>> {
        let manifest = self.manifest(outcomes);
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        for (entry, outcome) in manifest.files.iter().zip(outcomes) {
            let (Some(name), Some(result)) = (&entry.output_filename, &outcome.result) else {
                continue;
            };
            writer
                .start_file(name.as_str(), stored)
                .map_err(|e| archive_error(&format!("add '{name}'"), e))?;
            writer
                .write_all(&result.bytes)
                .map_err(|e| archive_error(&format!("write '{name}'"), e))?;
        }

        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| archive_error("serialize manifest", e))?;
        writer
            .start_file(
                MANIFEST_NAME,
                SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
            )
            .map_err(|e| archive_error("add manifest", e))?;
        writer
            .write_all(&manifest_json)
            .map_err(|e| archive_error("write manifest", e))?;

        let cursor = writer
            .finish()
            .map_err(|e| archive_error("finalize archive", e))?;
        Ok(cursor.into_inner())
    }
}

fn archive_error(operation: &str, error: impl std::fmt::Display) -> BgRemovalError {
    BgRemovalError::internal(format!("Failed to {operation}: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Duration;

    fn result(bytes: &[u8]) -> ProcessingResult {
        ProcessingResult {
            bytes: bytes.to_vec(),
            content_type: "image/png",
            output_format: OutputFormat::Png,
            input_size: 100,
            output_size: bytes.len(),
            elapsed: Duration::from_millis(12),
            model: "mock".to_string(),
            dimensions: (4, 3),
        }
    }

    fn outcomes() -> Vec<BatchItemOutcome> {
        vec![
            BatchItemOutcome::succeeded(0, "a.jpg", result(b"first")),
            BatchItemOutcome::failed(1, "b.jpg", &BgRemovalError::decode("bad header")),
            BatchItemOutcome::succeeded(2, "c.png", result(b"third")),
        ]
    }

    #[test]
    fn test_manifest_counts_and_order() {
        let manifest = BatchArchive::new("req-1", "mock", OutputFormat::Png).manifest(&outcomes());

        assert_eq!(manifest.total_files, 3);
        assert_eq!(manifest.processed, 2);
        assert_eq!(manifest.failed, 1);
        assert_eq!(
            manifest.files.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        let failed = &manifest.files[1];
        assert!(!failed.success);
        assert_eq!(failed.status_code, 400);
        assert!(failed.error.as_ref().unwrap().contains("bad header"));
        assert!(failed.output_filename.is_none());

        assert_eq!(manifest.files[0].output_filename.as_deref(), Some("no_bg_a.png"));
        assert_eq!(manifest.files[2].processing_time_ms, Some(12));
    }

    #[test]
    fn test_duplicate_names_get_index_suffix() {
        let outcomes = vec![
            BatchItemOutcome::succeeded(0, "same.jpg", result(b"1")),
            BatchItemOutcome::succeeded(1, "same.jpg", result(b"2")),
        ];
        let manifest = BatchArchive::new("req", "mock", OutputFormat::Png).manifest(&outcomes);

        assert_eq!(manifest.files[0].output_filename.as_deref(), Some("no_bg_same.png"));
        assert_eq!(manifest.files[1].output_filename.as_deref(), Some("no_bg_same_1.png"));
    }

    #[test]
    fn test_archive_contents() {
        let bytes = BatchArchive::new("req-2", "mock", OutputFormat::Png)
            .build(&outcomes())
            .unwrap();

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 3);

        let mut first = Vec::new();
        archive.by_name("no_bg_a.png").unwrap().read_to_end(&mut first).unwrap();
        assert_eq!(first, b"first");

        let mut manifest_json = String::new();
        archive
            .by_name(MANIFEST_NAME)
            .unwrap()
            .read_to_string(&mut manifest_json)
            .unwrap();
        let manifest: BatchManifest = serde_json::from_str(&manifest_json).unwrap();
        assert_eq!(manifest.request_id, "req-2");
        assert_eq!(manifest.failed, 1);
    }

    #[test]
    fn test_client_failure_classification() {
        let decode = BatchItemOutcome::failed(0, "x.jpg", &BgRemovalError::decode("x"));
        let inference = BatchItemOutcome::failed(1, "y.jpg", &BgRemovalError::inference("x"));
        assert!(decode.is_client_failure());
        assert!(!inference.is_client_failure());
    }
}
