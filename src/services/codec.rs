//! Image codec adapter
//!
//! Runs one upload through the full pipeline: decode, gated segmentation,
//! compositing, optional resize and re-encoding. Every CPU-bound step runs on a
//! blocking worker; only segmentation holds a gate slot.

use crate::{
    config::OutputFormat,
    error::{BgRemovalError, Result},
    gate::ConcurrencyGate,
    services::format::{OutputDimensions, OutputFormatHandler},
    session::ModelSession,
    tracing_config::events,
    utils::ImagePostprocessor,
};
use image::DynamicImage;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One decoded-to-be upload plus its output parameters
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    pub image_bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub filename: String,
    pub output_format: OutputFormat,
    pub quality: u8,
    pub output_dimensions: Option<OutputDimensions>,
}

/// Encoded cut-out and the metadata reported alongside it
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub output_format: OutputFormat,
    pub input_size: usize,
    pub output_size: usize,
    pub elapsed: Duration,
    pub model: String,
    /// Output image `(width, height)`
    pub dimensions: (u32, u32),
}

impl ProcessingResult {
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Decode a byte buffer into an image
///
/// # Errors
/// - `Decode` for unrecognized, truncated or zero-sized images
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(bytes).map_err(|e| BgRemovalError::decode(e.to_string()))?;
    if image.width() == 0 || image.height() == 0 {
        return Err(BgRemovalError::decode("image has zero width or height"));
    }
    Ok(image)
}

/// Output filename for an uploaded file: `no_bg_<stem>.<ext>`
#[must_use]
pub fn output_filename(filename: &str, format: OutputFormat) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let stem = match base.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => base,
    };
    let sanitized: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let stem = if sanitized.is_empty() { "image" } else { sanitized.as_str() };

    format!("no_bg_{stem}.{}", format.extension())
}

/// Stateless pipeline around a shared concurrency gate
#[derive(Debug, Clone)]
pub struct ImageCodecAdapter {
    gate: ConcurrencyGate,
}

impl ImageCodecAdapter {
    #[must_use]
    pub fn new(gate: ConcurrencyGate) -> Self {
        Self { gate }
    }

    #[must_use]
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Remove the background of one uploaded image
    ///
    /// # Errors
    /// - `Decode` when the upload is not a readable image
    /// - `BackendUnavailable` when no gate slot can be obtained
    /// - `Inference` when the backend call fails
    /// - `Encode` when the output cannot be written
    pub async fn process(
        &self,
        request: ProcessingRequest,
        session: Arc<ModelSession>,
    ) -> Result<ProcessingResult> {
        let started = Instant::now();
        let ProcessingRequest {
            image_bytes,
            filename,
            output_format,
            quality,
            output_dimensions,
            ..
        } = request;
        let input_size = image_bytes.len();

        let image = Arc::new(
            tokio::task::spawn_blocking(move || decode_image(&image_bytes))
                .await
                .map_err(|e| BgRemovalError::internal(format!("Decode worker failed: {e}")))??,
        );
        tracing::debug!(
            filename = %filename,
            width = image.width(),
            height = image.height(),
            "Decoded upload"
        );

        let segmentation = {
            let image = Arc::clone(&image);
            let session = Arc::clone(&session);
            self.gate.run_blocking(move || session.segment(&image)).await?
        };

        let (bytes, dimensions) = tokio::task::spawn_blocking(move || {
            let cutout = ImagePostprocessor::composite(&image, segmentation);
            let cutout = OutputFormatHandler::resize(cutout, output_dimensions);
            let dimensions = cutout.dimensions();
            OutputFormatHandler::encode(&cutout, output_format, quality).map(|b| (b, dimensions))
        })
        .await
        .map_err(|e| BgRemovalError::internal(format!("Encode worker failed: {e}")))??;

        let elapsed = started.elapsed();
        let output_size = bytes.len();
        events::performance_metric(
            "remove_background",
            u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            Some(output_size),
        );

        Ok(ProcessingResult {
            bytes,
            content_type: output_format.content_type(),
            output_format,
            input_size,
            output_size,
            elapsed,
            model: session.name().to_string(),
            dimensions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::MockBackend;
    use crate::config::BackendConfig;
    use crate::inference::InferenceBackend;
    use crate::models::OutputActivation;
    use image::{GenericImageView, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn session(backend: MockBackend) -> Arc<ModelSession> {
        let mut backend = backend;
        backend.initialize(&BackendConfig::default()).unwrap();
        Arc::new(
            ModelSession::new("mock", Box::new(backend), OutputActivation::None, Duration::ZERO)
                .unwrap(),
        )
    }

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = RgbImage::from_pixel(width, height, Rgb([200, 120, 40]));
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image)
            .write_to(&mut buffer, ImageFormat::Jpeg)
            .unwrap();
        buffer.into_inner()
    }

    fn request(bytes: Vec<u8>, format: OutputFormat) -> ProcessingRequest {
        ProcessingRequest {
            image_bytes: bytes,
            content_type: Some("image/jpeg".to_string()),
            filename: "photo.jpg".to_string(),
            output_format: format,
            quality: 90,
            output_dimensions: None,
        }
    }

    #[test]
    fn test_output_filename() {
        assert_eq!(output_filename("photo.jpg", OutputFormat::Png), "no_bg_photo.png");
        assert_eq!(
            output_filename("dir/my photo.final.jpeg", OutputFormat::Jpeg),
            "no_bg_my_photo.final.jpg"
        );
        assert_eq!(output_filename("noext", OutputFormat::WebP), "no_bg_noext.webp");
        assert_eq!(output_filename("", OutputFormat::Png), "no_bg_image.png");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, BgRemovalError::Decode(_)));
        assert!(err.to_string().contains("decode"));
    }

    #[tokio::test]
    async fn test_process_png_keeps_dimensions_and_adds_alpha() {
        let adapter = ImageCodecAdapter::new(ConcurrencyGate::new(2, None));
        let result = adapter
            .process(request(jpeg_bytes(120, 80), OutputFormat::Png), session(MockBackend::new()))
            .await
            .unwrap();

        assert_eq!(result.content_type, "image/png");
        assert_eq!(result.dimensions, (120, 80));
        assert_eq!(result.output_size, result.bytes.len());
        assert_eq!(result.model, "mock");

        let decoded = image::load_from_memory(&result.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (120, 80));
        assert!(decoded.color().has_alpha());
        assert_eq!(adapter.gate().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_process_resizes_output() {
        let adapter = ImageCodecAdapter::new(ConcurrencyGate::new(1, None));
        let mut req = request(jpeg_bytes(200, 100), OutputFormat::WebP);
        req.output_dimensions = OutputDimensions::new(Some(50), None);

        let result = adapter.process(req, session(MockBackend::new())).await.unwrap();
        assert_eq!(result.dimensions, (50, 25));
        assert_eq!(result.content_type, "image/webp");
    }

    #[tokio::test]
    async fn test_decode_failure_skips_segmentation() {
        let backend = MockBackend::new();
        let counters = backend.counters();
        let adapter = ImageCodecAdapter::new(ConcurrencyGate::new(1, None));

        let err = adapter
            .process(request(b"garbage".to_vec(), OutputFormat::Png), session(backend))
            .await
            .unwrap_err();

        assert!(matches!(err, BgRemovalError::Decode(_)));
        assert_eq!(counters.calls(), 0);
        assert_eq!(adapter.gate().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_inference_failure_releases_slot() {
        let adapter = ImageCodecAdapter::new(ConcurrencyGate::new(1, None));
        let err = adapter
            .process(
                request(jpeg_bytes(16, 16), OutputFormat::Png),
                session(MockBackend::new_failing_inference()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BgRemovalError::Inference(_)));
        assert_eq!(adapter.gate().stats().in_use, 0);
    }

    #[tokio::test]
    async fn test_identical_requests_identical_output() {
        let adapter = ImageCodecAdapter::new(ConcurrencyGate::new(2, None));
        let session = session(MockBackend::new());
        let bytes = jpeg_bytes(64, 48);

        let first = adapter
            .process(request(bytes.clone(), OutputFormat::Png), Arc::clone(&session))
            .await
            .unwrap();
        let second = adapter
            .process(request(bytes, OutputFormat::Png), session)
            .await
            .unwrap();
        assert_eq!(first.bytes, second.bytes);
    }
}
