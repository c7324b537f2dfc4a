//! Turns raw image bytes into the normalized tensor the classifier expects.

use image::imageops::{self, FilterType};
use image::DynamicImage;
use serde::Deserialize;

use crate::classifier::FeatureMap;
use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// The shorter image side is resized to this length first.
    pub resize_shorter: u32,
    /// Side of the square center crop fed to the classifier.
    pub crop_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            resize_shorter: 256,
            crop_size: 224,
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self, ConfigError> {
        if config.crop_size == 0 || config.resize_shorter < config.crop_size {
            return Err(ConfigError::OutOfRange {
                key: "preprocess_crop_size",
                message: format!(
                    "crop {} must be positive and fit in the resized side {}",
                    config.crop_size, config.resize_shorter
                ),
            });
        }
        if let Some(s) = config.std.iter().find(|s| s.is_nan() || **s <= 0.0) {
            return Err(ConfigError::OutOfRange {
                key: "preprocess_std",
                message: format!("standard deviation {s} must be positive"),
            });
        }
        Ok(Self { config })
    }

    pub fn crop_size(&self) -> u32 {
        self.config.crop_size
    }

    pub fn tensor_from_bytes(&self, bytes: &[u8]) -> Result<FeatureMap, image::ImageError> {
        let image = image::load_from_memory(bytes)?;
        Ok(self.tensor_from_image(&image))
    }

    /// Resize, center crop and normalize into a `[3, crop, crop]` tensor.
    pub fn tensor_from_image(&self, image: &DynamicImage) -> FeatureMap {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();
        let shorter = self.config.resize_shorter;
        let (new_width, new_height) = if width <= height {
            (shorter, scale_side(height, shorter, width))
        } else {
            (scale_side(width, shorter, height), shorter)
        };
        let resized = imageops::resize(&rgb, new_width, new_height, FilterType::Triangle);

        let crop = self.config.crop_size;
        let left = centered_offset(new_width, crop);
        let top = centered_offset(new_height, crop);
        let cropped = imageops::crop_imm(&resized, left, top, crop, crop).to_image();

        let PreprocessConfig { mean, std, .. } = self.config;
        FeatureMap::from_shape_fn((3, crop as usize, crop as usize), |(c, y, x)| {
            let value = cropped[(x as u32, y as u32)][c] as f32 / 255.0;
            (value - mean[c]) / std[c]
        })
    }
}

/// `side * target / reference`, truncated like the usual vision transforms.
fn scale_side(side: u32, target: u32, reference: u32) -> u32 {
    ((side as u64 * target as u64) / reference.max(1) as u64).max(1) as u32
}

fn centered_offset(extent: u32, crop: u32) -> u32 {
    ((extent.saturating_sub(crop) as f32) / 2.0).round() as u32
}
