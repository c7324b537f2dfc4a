//! Heuristic gate that turns away images that cannot be brain MRI scans.
//!
//! The checks are cheap statistics on the decoded pixels: scans are roughly
//! square, grayscale, and surrounded by a dark background. A rejection is a
//! normal outcome and carries the reason shown to the user.

use image::DynamicImage;
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Smallest accepted width / height.
    pub min_aspect_ratio: f32,
    /// Largest accepted width / height.
    pub max_aspect_ratio: f32,
    /// Upper bound for `mean|B - G| + mean|G - R|`.
    pub max_channel_difference: f32,
    /// Luma below this counts as background.
    pub dark_pixel_threshold: u8,
    /// Smallest accepted share of background pixels.
    pub min_dark_fraction: f32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_aspect_ratio: 0.5,
            max_aspect_ratio: 2.0,
            max_channel_difference: 30.0,
            dark_pixel_threshold: 30,
            min_dark_fraction: 0.20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    UnreadableImage,
    AspectRatio,
    ColorProfile,
    Background,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::UnreadableImage => write!(f, "Invalid image format"),
            RejectionReason::AspectRatio => write!(f, "Invalid aspect ratio for MRI"),
            RejectionReason::ColorProfile => write!(
                f,
                "Image appears to be a color photograph, not an MRI"
            ),
            RejectionReason::Background => write!(
                f,
                "Image lacks characteristic MRI background (too bright)"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Accepted,
    Rejected(RejectionReason),
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        matches!(self, Validation::Accepted)
    }

    pub fn reason(&self) -> String {
        match self {
            Validation::Accepted => "Valid".to_string(),
            Validation::Rejected(reason) => reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Result<Self, ConfigError> {
        if !(config.min_aspect_ratio > 0.0 && config.min_aspect_ratio <= config.max_aspect_ratio)
        {
            return Err(ConfigError::OutOfRange {
                key: "validator_min_aspect_ratio",
                message: format!(
                    "need 0 < min ({}) <= max ({})",
                    config.min_aspect_ratio, config.max_aspect_ratio
                ),
            });
        }
        if !(0.0..=1.0).contains(&config.min_dark_fraction) {
            return Err(ConfigError::OutOfRange {
                key: "validator_min_dark_fraction",
                message: format!("{} is not a fraction", config.min_dark_fraction),
            });
        }
        if config.max_channel_difference.is_nan() || config.max_channel_difference < 0.0 {
            return Err(ConfigError::OutOfRange {
                key: "validator_max_channel_difference",
                message: format!("{} must be non-negative", config.max_channel_difference),
            });
        }
        Ok(Self { config })
    }

    pub fn validate(&self, bytes: &[u8]) -> Validation {
        match image::load_from_memory(bytes) {
            Ok(image) => self.validate_image(&image),
            Err(err) => {
                tracing::debug!(error = %err, "validator could not decode image");
                Validation::Rejected(RejectionReason::UnreadableImage)
            }
        }
    }

    pub fn validate_image(&self, image: &DynamicImage) -> Validation {
        let (width, height) = (image.width(), image.height());
        if width == 0 || height == 0 {
            return Validation::Rejected(RejectionReason::UnreadableImage);
        }
        let ratio = width as f32 / height as f32;
        if ratio < self.config.min_aspect_ratio || ratio > self.config.max_aspect_ratio {
            return Validation::Rejected(RejectionReason::AspectRatio);
        }

        let difference = channel_difference(image);
        if difference > self.config.max_channel_difference {
            tracing::debug!(difference, "image is too colorful");
            return Validation::Rejected(RejectionReason::ColorProfile);
        }

        let dark = dark_fraction(image, self.config.dark_pixel_threshold);
        if dark < self.config.min_dark_fraction {
            tracing::debug!(dark, "image background is too bright");
            return Validation::Rejected(RejectionReason::Background);
        }

        Validation::Accepted
    }
}

/// `mean|B - G| + mean|G - R|` over all pixels; zero for grayscale images.
fn channel_difference(image: &DynamicImage) -> f32 {
    let rgb = image.to_rgb8();
    let pixels = (u64::from(rgb.width()) * u64::from(rgb.height())).max(1) as f64;
    let (mut blue_green, mut green_red) = (0u64, 0u64);
    for pixel in rgb.pixels() {
        let [r, g, b] = pixel.0;
        blue_green += u64::from(b.abs_diff(g));
        green_red += u64::from(g.abs_diff(r));
    }
    ((blue_green as f64 + green_red as f64) / pixels) as f32
}

fn dark_fraction(image: &DynamicImage, threshold: u8) -> f32 {
    let luma = image.to_luma8();
    let total = (luma.width() as usize * luma.height() as usize).max(1);
    let dark = luma.pixels().filter(|p| p.0[0] < threshold).count();
    dark as f32 / total as f32
}
