//! Model file acquisition
//!
//! Makes sure a registry model's ONNX file is present in the local cache
//! directory, downloading it over HTTPS when it is missing and downloads are
//! allowed. Downloads stream into a `.part` file that is renamed into place
//! only after it completed (and passed the optional SHA-256 check).

use crate::error::{BgRemovalError, Result};
use crate::models::ModelDescriptor;
use crate::tracing_config::{events, spans};
use futures_util::stream::TryStreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::Instrument;

/// Model downloader bound to one cache directory
#[derive(Debug, Clone)]
pub struct ModelDownloader {
    client: Client,
    cache_dir: PathBuf,
    base_url: String,
    allow_download: bool,
}

impl ModelDownloader {
    /// Create a new model downloader
    ///
    /// # Errors
    /// - Invalid base URL
    /// - Failed to create HTTP client
    pub fn new<P: Into<PathBuf>>(cache_dir: P, base_url: &str, allow_download: bool) -> Result<Self> {
        validate_model_url(base_url)?;

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(|e| BgRemovalError::network_error("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            allow_download,
        })
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path the model file occupies inside the cache
    #[must_use]
    pub fn model_path(&self, descriptor: &ModelDescriptor) -> PathBuf {
        self.cache_dir.join(descriptor.file_name)
    }

    /// Whether the model file is already present in the cache
    #[must_use]
    pub fn is_cached(&self, descriptor: &ModelDescriptor) -> bool {
        self.model_path(descriptor).is_file()
    }

    /// Return the cached model path, downloading the file first if needed
    ///
    /// # Errors
    /// - Model missing and downloads disabled
    /// - Network errors during download
    /// - File system errors in the cache directory
    /// - SHA-256 mismatch
    pub async fn ensure_model(
        &self,
        descriptor: &ModelDescriptor,
        expected_sha256: Option<&str>,
    ) -> Result<PathBuf> {
        let final_path = self.model_path(descriptor);

        let cached = tokio::fs::metadata(&final_path)
            .await
            .is_ok_and(|metadata| metadata.is_file());
        if cached {
            log::debug!("Model {} found in cache at {}", descriptor.name, final_path.display());
            if let Some(expected) = expected_sha256 {
                if !verify_in_worker(&final_path, Some(expected)).await? {
                    return Err(BgRemovalError::model(format!(
                        "Cached model '{}' failed integrity verification",
                        final_path.display()
                    )));
                }
            }
            return Ok(final_path);
        }

        if !self.allow_download {
            return Err(BgRemovalError::model(format!(
                "Model '{}' not found at {} and downloads are disabled",
                descriptor.name,
                final_path.display()
            )));
        }

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(|e| {
            BgRemovalError::file_io_error("create model cache directory", &self.cache_dir, &e)
        })?;

        let url = descriptor.download_url(&self.base_url);
        let part_path = final_path.with_extension("onnx.part");

        log::info!("Downloading model {} from {}", descriptor.name, url);
        let span = spans::download(&url, &final_path);
        let result = self.download_file(&url, &part_path).instrument(span).await;

        if let Err(e) = result {
            Self::discard_partial(&part_path).await;
            return Err(e);
        }

        if !verify_in_worker(&part_path, expected_sha256).await? {
            Self::discard_partial(&part_path).await;
            return Err(BgRemovalError::network_error(
                format!("Downloaded model {}", descriptor.name),
                "SHA-256 checksum mismatch",
            ));
        }

        tokio::fs::rename(&part_path, &final_path).await.map_err(|e| {
            BgRemovalError::file_io_error("move downloaded model into cache", &final_path, &e)
        })?;

        log::info!("Successfully downloaded model: {}", descriptor.name);
        Ok(final_path)
    }

    async fn discard_partial(part_path: &Path) {
        match tokio::fs::remove_file(part_path).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => log::warn!("Failed to remove partial download: {}", e),
        }
    }

    /// Download a single file by streaming it to `local_path`
    async fn download_file(&self, url: &str, local_path: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| BgRemovalError::network_error(format!("Failed to download {url}"), e))?;

        if !response.status().is_success() {
            return Err(BgRemovalError::network_error(
                format!("Failed to download {url}"),
                format!("HTTP {}", response.status()),
            ));
        }

        let total_size = response.content_length();

        let mut file = tokio::fs::File::create(local_path)
            .await
            .map_err(|e| BgRemovalError::file_io_error("create file", local_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut last_reported = 0u64;
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let bytes_read = tokio::io::AsyncReadExt::read(&mut stream, &mut buffer)
                .await
                .map_err(|e| BgRemovalError::network_error("Failed to read download stream", e))?;

            if bytes_read == 0 {
                break;
            }

            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| BgRemovalError::file_io_error("write to file", local_path, &e))?;

            downloaded += bytes_read as u64;
            if downloaded - last_reported >= 8 * 1024 * 1024 {
                events::download_progress(url, downloaded, total_size);
                last_reported = downloaded;
            }
        }

        file.flush()
            .await
            .map_err(|e| BgRemovalError::file_io_error("flush file", local_path, &e))?;

        if let Some(total) = total_size {
            if downloaded != total {
                return Err(BgRemovalError::network_error(
                    format!("Incomplete download of {url}"),
                    format!("received {downloaded} of {total} bytes"),
                ));
            }
        }

        log::debug!("Downloaded {} bytes to {}", downloaded, local_path.display());
        Ok(())
    }
}

/// Verify the integrity of a file using SHA-256
///
/// Returns `Ok(true)` when no hash is expected.
///
/// # Errors
/// - File cannot be read
pub fn verify_file_integrity(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
    let Some(expected) = expected_hash else {
        return Ok(true);
    };

    let mut file = fs::File::open(file_path)
        .map_err(|e| BgRemovalError::file_io_error("read file for verification", file_path, &e))?;

    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| BgRemovalError::file_io_error("read file for verification", file_path, &e))?;
    let actual_hash = format!("{:x}", hasher.finalize());

    if actual_hash.eq_ignore_ascii_case(expected.trim()) {
        Ok(true)
    } else {
        log::warn!(
            "File integrity check failed for {}: expected {}, got {}",
            file_path.display(),
            expected,
            actual_hash
        );
        Ok(false)
    }
}

/// [`verify_file_integrity`] on a blocking worker; model files are large
async fn verify_in_worker(file_path: &Path, expected_hash: Option<&str>) -> Result<bool> {
    if expected_hash.is_none() {
        return Ok(true);
    }

    let file_path = file_path.to_path_buf();
    let expected_hash = expected_hash.map(ToString::to_string);
    tokio::task::spawn_blocking(move || verify_file_integrity(&file_path, expected_hash.as_deref()))
        .await
        .map_err(|e| BgRemovalError::internal(format!("Integrity check task failed: {e}")))?
}

/// Validate that a URL can serve model downloads
///
/// # Errors
/// - Empty URL
/// - Anything other than an `https://` URL with a host
pub fn validate_model_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Err(BgRemovalError::invalid_config("Model URL cannot be empty"));
    }

    let Some(rest) = url.strip_prefix("https://") else {
        return Err(BgRemovalError::invalid_config(format!(
            "Unsupported URL format: {url}. Model downloads require an https:// URL"
        )));
    };

    let host = rest.split('/').next().unwrap_or_default();
    if host.is_empty() {
        return Err(BgRemovalError::invalid_config(format!(
            "Invalid model URL: {url}. Missing host"
        )));
    }

    Ok(())
}
