//! Image to tensor preprocessing
//!
//! rembg models expect the whole image stretched to the model input size
//! (no letterboxing), scaled by its brightest pixel value and normalized per
//! channel with the model's mean and standard deviation.

use crate::{
    error::{BgRemovalError, Result},
    models::PreprocessingConfig,
};
use image::{imageops::FilterType, DynamicImage};
use ndarray::Array4;

/// Shared image preprocessing utilities
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Convert an image into a normalized NCHW tensor of shape `(1, 3, H, W)`
    ///
    /// # Errors
    /// - Zero-sized image or model input size
    pub fn preprocess_for_inference(
        image: &DynamicImage,
        preprocessing_config: &PreprocessingConfig,
    ) -> Result<Array4<f32>> {
        let [target_width, target_height] = preprocessing_config.target_size;
        if target_width == 0 || target_height == 0 {
            return Err(BgRemovalError::processing("Model input size must be non-zero"));
        }
        if image.width() == 0 || image.height() == 0 {
            return Err(BgRemovalError::processing("Cannot preprocess an empty image"));
        }

        let rgb_image = image.to_rgb8();
        let resized = image::imageops::resize(
            &rgb_image,
            target_width,
            target_height,
            FilterType::Lanczos3,
        );

        let max_value = resized
            .as_raw()
            .iter()
            .copied()
            .max()
            .map_or(0.0, f32::from)
            .max(1e-6);

        let mean = preprocessing_config.normalization_mean;
        let std = preprocessing_config.normalization_std;
        let height = target_height as usize;
        let width = target_width as usize;

        let mut tensor = Array4::<f32>::zeros((1, 3, height, width));

        #[allow(clippy::indexing_slicing)]
        // Tensor dimensions are allocated to match the resized image
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                tensor[[0, channel, y as usize, x as usize]] =
                    (f32::from(pixel[channel]) / max_value - mean[channel]) / std[channel];
            }
        }

        Ok(tensor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn config(size: u32, mean: [f32; 3], std: [f32; 3]) -> PreprocessingConfig {
        PreprocessingConfig {
            target_size: [size, size],
            normalization_mean: mean,
            normalization_std: std,
        }
    }

    fn solid_image(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(width, height, Rgb(color));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_tensor_shape_matches_model_input() {
        let image = solid_image(100, 40, [255, 0, 0]);
        let tensor = ImagePreprocessor::preprocess_for_inference(
            &image,
            &config(64, [0.5; 3], [1.0; 3]),
        )
        .unwrap();

        assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
    }

    #[test]
    fn test_normalization_uses_max_pixel_value() {
        // Brightest value 200 maps to 1.0, not 200/255
        let image = solid_image(10, 10, [200, 100, 0]);
        let tensor = ImagePreprocessor::preprocess_for_inference(
            &image,
            &config(8, [0.5; 3], [1.0; 3]),
        )
        .unwrap();

        assert!((tensor[[0, 0, 4, 4]] - 0.5).abs() < 1e-2);
        assert!(tensor[[0, 1, 4, 4]].abs() < 1e-2);
        assert!((tensor[[0, 2, 4, 4]] + 0.5).abs() < 1e-2);
    }

    #[test]
    fn test_imagenet_normalization() {
        let image = solid_image(16, 16, [255, 255, 255]);
        let tensor = ImagePreprocessor::preprocess_for_inference(
            &image,
            &config(8, [0.485, 0.456, 0.406], [0.229, 0.224, 0.225]),
        )
        .unwrap();

        let expected_r = (1.0 - 0.485) / 0.229;
        assert!((tensor[[0, 0, 0, 0]] - expected_r).abs() < 1e-2);
    }

    #[test]
    fn test_black_image_does_not_divide_by_zero() {
        let image = solid_image(4, 4, [0, 0, 0]);
        let tensor = ImagePreprocessor::preprocess_for_inference(
            &image,
            &config(4, [0.5; 3], [1.0; 3]),
        )
        .unwrap();

        assert!(tensor.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_zero_target_size_rejected() {
        let image = solid_image(4, 4, [10, 10, 10]);
        assert!(ImagePreprocessor::preprocess_for_inference(
            &image,
            &config(0, [0.5; 3], [1.0; 3])
        )
        .is_err());
    }
}
