//! Model output to alpha mask conversion and compositing

use crate::{
    error::{BgRemovalError, Result},
    models::OutputActivation,
};
use image::{imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma, Rgba, RgbaImage};
use ndarray::Array4;

/// Output of one segmentation call, already at the source image size
#[derive(Debug, Clone, PartialEq)]
pub enum Segmentation {
    /// Single-channel foreground probability (255 = foreground)
    Mask(GrayImage),
    /// Backend produced the cut-out image itself
    Cutout(RgbaImage),
}

/// Shared image postprocessing utilities
pub struct ImagePostprocessor;

impl ImagePostprocessor {
    /// Convert a model output tensor to a segmentation at `original_dimensions`
    ///
    /// One output channel is a mask: the optional activation is applied, values are
    /// min-max normalized over the whole map, scaled to `u8` and resized with Lanczos3.
    /// Four output channels are an RGBA cut-out with values in `[0, 1]`.
    ///
    /// # Errors
    /// - Empty tensor or a channel count other than 1 or 4
    pub fn tensor_to_segmentation(
        tensor: &Array4<f32>,
        activation: OutputActivation,
        original_dimensions: (u32, u32),
    ) -> Result<Segmentation> {
        let (batch, channels, height, width) = tensor.dim();
        if batch == 0 || height == 0 || width == 0 {
            return Err(BgRemovalError::processing(format!(
                "Invalid output tensor shape {:?}",
                tensor.dim()
            )));
        }
        let (orig_width, orig_height) = original_dimensions;

        match channels {
            1 => {
                let mask = Self::tensor_to_mask(tensor, activation)?;
                Ok(Segmentation::Mask(image::imageops::resize(
                    &mask,
                    orig_width,
                    orig_height,
                    FilterType::Lanczos3,
                )))
            },
            4 => {
                let cutout = Self::tensor_to_rgba(tensor)?;
                Ok(Segmentation::Cutout(image::imageops::resize(
                    &cutout,
                    orig_width,
                    orig_height,
                    FilterType::Lanczos3,
                )))
            },
            other => Err(BgRemovalError::processing(format!(
                "Unsupported output channel count {other} (expected 1 or 4)"
            ))),
        }
    }

    /// Min-max normalize the first output map into a mask at model resolution
    fn tensor_to_mask(tensor: &Array4<f32>, activation: OutputActivation) -> Result<GrayImage> {
        let (_, _, height, width) = tensor.dim();
        let activate = |value: f32| match activation {
            OutputActivation::None => value,
            OutputActivation::Sigmoid => 1.0 / (1.0 + (-value).exp()),
        };

        let map = tensor.slice(ndarray::s![0, 0, .., ..]);
        let (min, max) = map
            .iter()
            .map(|&v| activate(v))
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            });

        let range = max - min;
        // A flat map carries no contrast to stretch; keep its absolute level instead
        let normalize = |value: f32| {
            if range > f32::EPSILON {
                (value - min) / range
            } else {
                value.clamp(0.0, 1.0)
            }
        };

        let buffer: Vec<u8> = map
            .iter()
            .map(|&v| (normalize(activate(v)) * 255.0).clamp(0.0, 255.0) as u8)
            .collect();

        ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(width as u32, height as u32, buffer)
            .ok_or_else(|| BgRemovalError::processing("Mask buffer size mismatch"))
    }

    fn tensor_to_rgba(tensor: &Array4<f32>) -> Result<RgbaImage> {
        let (_, _, height, width) = tensor.dim();
        let mut image = RgbaImage::new(width as u32, height as u32);

        for (x, y, pixel) in image.enumerate_pixels_mut() {
            let mut rgba = [0u8; 4];
            for (channel, value) in rgba.iter_mut().enumerate() {
                let sample = tensor
                    .get([0, channel, y as usize, x as usize])
                    .copied()
                    .ok_or_else(|| BgRemovalError::processing("Cut-out tensor index out of range"))?;
                *value = (sample.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
            *pixel = Rgba(rgba);
        }

        Ok(image)
    }

    /// Apply a mask as the alpha channel of `image`
    ///
    /// Colour channels are preserved; the resulting alpha is the product of the
    /// source alpha and the mask.
    #[must_use]
    pub fn apply_mask(image: &DynamicImage, mask: &GrayImage) -> RgbaImage {
        let mut result = image.to_rgba8();

        for (x, y, pixel) in result.enumerate_pixels_mut() {
            let mask_value = mask.get_pixel_checked(x, y).map_or(0, |p| p[0]);
            let alpha = u16::from(pixel[3]) * u16::from(mask_value) / 255;
            pixel[3] = alpha as u8;
        }

        result
    }

    /// Turn a segmentation into the final RGBA cut-out for `image`
    #[must_use]
    pub fn composite(image: &DynamicImage, segmentation: Segmentation) -> RgbaImage {
        match segmentation {
            Segmentation::Mask(mask) => Self::apply_mask(image, &mask),
            Segmentation::Cutout(cutout) => cutout,
        }
    }
}
