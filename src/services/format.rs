//! Output format handling service
//!
//! Turns the RGBA cut-out into the bytes of the requested output format,
//! applying the optional output resize first.

use crate::{
    config::{OutputFormat, MAX_OUTPUT_DIMENSION},
    error::{BgRemovalError, Result},
};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilterType, PngEncoder};
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};
use serde::{Deserialize, Serialize};

/// Requested output size; a single dimension keeps the aspect ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputDimensions {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl OutputDimensions {
    /// `None` when neither dimension is set
    #[must_use]
    pub fn new(width: Option<u32>, height: Option<u32>) -> Option<Self> {
        (width.is_some() || height.is_some()).then_some(Self { width, height })
    }

    /// Final size for a source of `(width, height)`
    #[must_use]
    pub fn target_size(&self, source: (u32, u32)) -> (u32, u32) {
        let (src_width, src_height) = source;
        let scaled = |numerator: u32, target: u32, denominator: u32| -> u32 {
            let value = (f64::from(numerator) * f64::from(target) / f64::from(denominator.max(1)))
                .round();
            (value as u32).clamp(1, MAX_OUTPUT_DIMENSION)
        };

        match (self.width, self.height) {
            (Some(width), Some(height)) => (width, height),
            (Some(width), None) => (width, scaled(src_height, width, src_width)),
            (None, Some(height)) => (scaled(src_width, height, src_height), height),
            (None, None) => source,
        }
    }
}

/// Service for handling output format conversions
pub struct OutputFormatHandler;

impl OutputFormatHandler {
    /// Resize the cut-out when output dimensions were requested
    #[must_use]
    pub fn resize(image: RgbaImage, dimensions: Option<OutputDimensions>) -> RgbaImage {
        let Some(dimensions) = dimensions else {
            return image;
        };

        let (width, height) = dimensions.target_size(image.dimensions());
        if (width, height) == image.dimensions() {
            return image;
        }
        image::imageops::resize(&image, width, height, FilterType::Lanczos3)
    }

    /// Composite an RGBA image over a solid colour, dropping the alpha channel
    #[must_use]
    pub fn flatten(image: &RgbaImage, background: [u8; 3]) -> RgbImage {
        let (width, height) = image.dimensions();
        let mut rgb_image = RgbImage::new(width, height);

        for (x, y, pixel) in image.enumerate_pixels() {
            let alpha = u32::from(pixel[3]);
            let blend = |channel: u8, bg: u8| -> u8 {
                ((u32::from(channel) * alpha + u32::from(bg) * (255 - alpha) + 127) / 255) as u8
            };
            rgb_image.put_pixel(
                x,
                y,
                image::Rgb([
                    blend(pixel[0], background[0]),
                    blend(pixel[1], background[1]),
                    blend(pixel[2], background[2]),
                ]),
            );
        }

        rgb_image
    }

    /// Encode the cut-out in `format`
    ///
    /// PNG is lossless with maximum compression, JPEG is flattened onto white,
    /// WEBP is lossy with alpha. JPEG and WEBP honour `quality`.
    ///
    /// # Errors
    /// - `Encode` when the encoder fails
    pub fn encode(image: &RgbaImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
        let (width, height) = image.dimensions();
        let mut buffer = Vec::new();

        let result = match format {
            OutputFormat::Png => PngEncoder::new_with_quality(
                &mut buffer,
                CompressionType::Best,
                PngFilterType::Adaptive,
            )
            .write_image(image.as_raw(), width, height, ExtendedColorType::Rgba8),
            OutputFormat::Jpeg => {
                let rgb_image = Self::flatten(image, [255, 255, 255]);
                JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).write_image(
                    rgb_image.as_raw(),
                    width,
                    height,
                    ExtendedColorType::Rgb8,
                )
            },
            OutputFormat::WebP => return Self::encode_webp(image, quality),
        };

        result.map_err(|e| BgRemovalError::encode(format!("{format}: {e}")))?;
        Ok(buffer)
    }

    fn encode_webp(image: &RgbaImage, quality: u8) -> Result<Vec<u8>> {
        let (width, height) = image.dimensions();
        let encoder = webp::Encoder::from_rgba(image.as_raw(), width, height);
        let encoded = encoder
            .encode_simple(false, f32::from(quality.clamp(1, 100)))
            .map_err(|e| BgRemovalError::encode(format!("WEBP: {e:?}")))?;
        Ok(encoded.to_vec())
    }

    /// Get the recommended quality settings for a format
    ///
    /// Returns `(default, min, max)` for formats that use a quality setting.
    #[must_use]
    pub fn get_quality_range(format: OutputFormat) -> Option<(u8, u8, u8)> {
        match format {
            OutputFormat::Jpeg | OutputFormat::WebP => Some((95, 1, 100)),
            OutputFormat::Png => None,
        }
    }
}
