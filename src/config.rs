//! Service configuration.
//!
//! Every setting has a default. Overrides come from a flat key/value lookup;
//! the HTTP component feeds it Spin application variables, so a deployment
//! tunes the validator thresholds or swaps the model bundle in `spin.toml`
//! without rebuilding.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::preprocess::PreprocessConfig;
use crate::render::RenderConfig;
use crate::validator::ValidatorConfig;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path of the JSON model manifest.
    pub manifest: PathBuf,
    /// Layer whose activations and gradients drive the explanation.
    pub target_layer: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            manifest: PathBuf::from("/model/manifest.json"),
            target_layer: "layer4".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub model: ModelConfig,
    pub validator: ValidatorConfig,
    pub preprocess: PreprocessConfig,
    pub render: RenderConfig,
    /// `tracing_subscriber::EnvFilter` directives.
    pub log_filter: String,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            validator: ValidatorConfig::default(),
            preprocess: PreprocessConfig::default(),
            render: RenderConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

fn parse<T>(key: &str, raw: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })
}

impl AnalyzerConfig {
    /// Defaults overridden by whichever keys `lookup` knows about.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup("model_manifest") {
            config.model.manifest = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("target_layer") {
            config.model.target_layer = raw;
        }
        if let Some(raw) = lookup("log_filter") {
            config.log_filter = raw;
        }

        let validator = &mut config.validator;
        if let Some(raw) = lookup("validator_min_aspect_ratio") {
            validator.min_aspect_ratio = parse("validator_min_aspect_ratio", raw)?;
        }
        if let Some(raw) = lookup("validator_max_aspect_ratio") {
            validator.max_aspect_ratio = parse("validator_max_aspect_ratio", raw)?;
        }
        if let Some(raw) = lookup("validator_max_channel_difference") {
            validator.max_channel_difference = parse("validator_max_channel_difference", raw)?;
        }
        if let Some(raw) = lookup("validator_dark_pixel_threshold") {
            validator.dark_pixel_threshold = parse("validator_dark_pixel_threshold", raw)?;
        }
        if let Some(raw) = lookup("validator_min_dark_fraction") {
            validator.min_dark_fraction = parse("validator_min_dark_fraction", raw)?;
        }

        if let Some(raw) = lookup("preprocess_resize_shorter") {
            config.preprocess.resize_shorter = parse("preprocess_resize_shorter", raw)?;
        }
        if let Some(raw) = lookup("preprocess_crop_size") {
            config.preprocess.crop_size = parse("preprocess_crop_size", raw)?;
        }

        if let Some(raw) = lookup("render_alpha") {
            config.render.alpha = parse("render_alpha", raw)?;
        }
        if let Some(raw) = lookup("render_jpeg_quality") {
            config.render.jpeg_quality = parse("render_jpeg_quality", raw)?;
        }

        Ok(config)
    }
}
