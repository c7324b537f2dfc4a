//! Request orchestration: validate, preprocess, classify, explain, render.
//!
//! An [`Analyzer`] is built once per process and reused for every scan. The
//! only shared mutable state it touches is the classifier, and every pass
//! through it goes through a [`crate::classifier::Session`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::classifier::{load_classifier, Classifier, Prediction};
use crate::config::AnalyzerConfig;
use crate::error::{AnalysisError, ConfigError, SetupError, Stage};
use crate::explain::GradCam;
use crate::preprocess::Preprocessor;
use crate::render::HeatmapRenderer;
use crate::validator::{Validation, Validator};

/// Confidence below this percentage marks a case as hard to call.
const LOW_CONFIDENCE: u8 = 85;

/// The JSON body returned for every analysed or rejected scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tumor_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gradcam_heatmap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay_image: Option<String>,
    pub prediction: String,
    pub confidence: u8,
    /// Same payload as `overlay_image`, kept for older clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heatmap: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
    pub is_tumor: bool,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResponse {
    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        Self {
            tumor_type: None,
            probability: None,
            gradcam_heatmap: None,
            overlay_image: None,
            prediction: "Invalid Input".to_string(),
            confidence: 0,
            heatmap: None,
            difficulty: None,
            is_tumor: false,
            verified: false,
            error: Some(format!("Invalid MRI Scan: {reason}")),
        }
    }

    pub fn from_prediction(
        prediction: &Prediction,
        gradcam_heatmap: String,
        overlay_image: String,
    ) -> Self {
        let probability = round_to(f64::from(prediction.probability), 4);
        let confidence = (probability * 100.0).round().clamp(0.0, 100.0) as u8;
        let is_tumor = prediction.is_tumor();
        let summary = if is_tumor {
            format!("Tumor Detected: {}", prediction.label)
        } else {
            "No Tumor Detected".to_string()
        };
        let difficulty = if confidence < LOW_CONFIDENCE {
            "High"
        } else {
            "Low"
        };
        Self {
            tumor_type: Some(prediction.label.clone()),
            probability: Some(probability),
            gradcam_heatmap: Some(gradcam_heatmap),
            heatmap: Some(overlay_image.clone()),
            overlay_image: Some(overlay_image),
            prediction: summary,
            confidence,
            difficulty: Some(difficulty.to_string()),
            is_tumor,
            verified: true,
            error: None,
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Hex SHA-256 of the submitted bytes, used to tell scans apart in logs.
pub fn scan_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub struct Analyzer {
    validator: Validator,
    preprocessor: Preprocessor,
    classifier: Arc<Classifier>,
    engine: GradCam,
    renderer: HeatmapRenderer,
}

impl Analyzer {
    pub fn new(classifier: Arc<Classifier>, config: &AnalyzerConfig) -> Result<Self, SetupError> {
        let preprocessor = Preprocessor::new(config.preprocess.clone())?;
        if preprocessor.crop_size() != classifier.input_size() {
            return Err(ConfigError::OutOfRange {
                key: "preprocess_crop_size",
                message: format!(
                    "crop {} does not match the classifier input size {}",
                    preprocessor.crop_size(),
                    classifier.input_size()
                ),
            }
            .into());
        }
        let engine = GradCam::new(&classifier, &config.model.target_layer)?;
        let renderer = HeatmapRenderer::new(config.render.clone(), classifier.input_size())?;
        Ok(Self {
            validator: Validator::new(config.validator.clone())?,
            preprocessor,
            classifier,
            engine,
            renderer,
        })
    }

    /// Loads the classifier named by `config.model` and wires the pipeline around it.
    pub fn from_config(config: &AnalyzerConfig) -> Result<Self, SetupError> {
        let classifier = load_classifier(&config.model.manifest)?;
        Self::new(Arc::new(classifier), config)
    }

    pub fn classifier(&self) -> &Arc<Classifier> {
        &self.classifier
    }

    pub fn analyze(&self, bytes: &[u8]) -> Result<AnalysisResponse, AnalysisError> {
        let span = tracing::info_span!("analyze", scan = %scan_digest(bytes), size = bytes.len());
        let _entered = span.enter();
        tracing::debug!(stage = %Stage::Received);

        if let Validation::Rejected(reason) = self.validator.validate(bytes) {
            tracing::warn!(%reason, "scan rejected");
            return Ok(AnalysisResponse::rejected(reason));
        }
        tracing::debug!(stage = %Stage::Validated);

        let input = self
            .preprocessor
            .tensor_from_bytes(bytes)
            .map_err(|source| AnalysisError::Decode {
                stage: Stage::Preprocessed,
                source,
            })?;
        tracing::debug!(stage = %Stage::Preprocessed);

        let prediction = self
            .classifier
            .session()
            .predict(&input)
            .map_err(|source| AnalysisError::Model {
                stage: Stage::Classified,
                source,
            })?;
        tracing::info!(
            label = %prediction.label,
            probability = prediction.probability,
            "scan classified"
        );

        let explanation = self
            .engine
            .generate(&self.classifier, &input, Some(prediction.class_index));
        tracing::debug!(
            stage = %Stage::Explained,
            fallback = explanation.fallback,
            peak = explanation.map.max()
        );

        let render_error = |source| AnalysisError::Render {
            stage: Stage::Rendered,
            source,
        };
        let gradcam = self
            .renderer
            .render_heatmap_only(&explanation.map)
            .map_err(render_error)?;
        let overlay = self
            .renderer
            .render_overlay(bytes, &explanation.map)
            .map_err(render_error)?;
        tracing::debug!(stage = %Stage::Rendered);

        let response = AnalysisResponse::from_prediction(&prediction, gradcam, overlay);
        tracing::debug!(stage = %Stage::Responded, confidence = response.confidence);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::toy_classifier;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use std::io::Cursor;

    fn disk_png(intensity: u8) -> Vec<u8> {
        let scan = GrayImage::from_fn(224, 224, |x, y| {
            if (x as f32 - 112.0).hypot(y as f32 - 112.0) < 80.0 {
                Luma([intensity])
            } else {
                Luma([0])
            }
        });
        let mut bytes = Cursor::new(Vec::new());
        DynamicImage::ImageLuma8(scan)
            .write_to(&mut bytes, ImageFormat::Png)
            .unwrap();
        bytes.into_inner()
    }

    fn analyzer() -> Analyzer {
        Analyzer::new(Arc::new(toy_classifier()), &AnalyzerConfig::default()).unwrap()
    }

    fn prediction(label: &str, probability: f32) -> Prediction {
        Prediction {
            class_index: 0,
            label: label.to_string(),
            probability,
        }
    }

    #[test]
    fn response_fields_follow_the_prediction() {
        let response = AnalysisResponse::from_prediction(
            &prediction("Glioma", 0.876_54),
            "data:a".into(),
            "data:b".into(),
        );
        assert_eq!(response.probability, Some(0.8765));
        assert_eq!(response.confidence, 88);
        assert_eq!(response.prediction, "Tumor Detected: Glioma");
        assert_eq!(response.difficulty.as_deref(), Some("Low"));
        assert_eq!(response.heatmap, response.overlay_image);
        assert!(response.is_tumor && response.verified);

        let response = AnalysisResponse::from_prediction(
            &prediction("No Tumor", 0.5),
            String::new(),
            String::new(),
        );
        assert_eq!(response.prediction, "No Tumor Detected");
        assert_eq!(response.confidence, 50);
        assert_eq!(response.difficulty.as_deref(), Some("High"));
        assert!(!response.is_tumor);
    }

    #[test]
    fn rejection_omits_prediction_fields() {
        let json = serde_json::to_value(AnalysisResponse::rejected("Invalid aspect ratio for MRI"))
            .unwrap();
        assert_eq!(json["error"], "Invalid MRI Scan: Invalid aspect ratio for MRI");
        assert_eq!(json["verified"], false);
        assert_eq!(json["confidence"], 0);
        assert_eq!(json["prediction"], "Invalid Input");
        assert!(json.get("tumor_type").is_none());
        assert!(json.get("gradcam_heatmap").is_none());
    }

    #[test]
    fn analyzes_a_synthetic_scan() {
        let analyzer = analyzer();
        let response = analyzer.analyze(&disk_png(200)).unwrap();
        assert!(response.verified);
        let label = response.tumor_type.clone().unwrap();
        assert!(analyzer.classifier().labels().contains(&label));
        let probability = response.probability.unwrap();
        assert_eq!(response.confidence, (probability * 100.0).round() as u8);
        assert_eq!(response.is_tumor, label != "No Tumor");
        assert!(response
            .gradcam_heatmap
            .unwrap()
            .starts_with("data:image/jpeg;base64,"));
        assert!(response.error.is_none());
        assert_eq!(analyzer.classifier().attached_hooks(), 0);
    }

    #[test]
    fn rejections_are_not_errors() {
        let response = analyzer().analyze(b"not an image").unwrap();
        assert!(!response.verified);
        assert_eq!(
            response.error.as_deref(),
            Some("Invalid MRI Scan: Invalid image format")
        );
    }

    #[test]
    fn mismatched_crop_size_is_a_setup_error() {
        let mut config = AnalyzerConfig::default();
        config.preprocess.crop_size = 200;
        let err = Analyzer::new(Arc::new(toy_classifier()), &config)
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Config(_)));

        let mut config = AnalyzerConfig::default();
        config.model.target_layer = "layer9".to_string();
        let err = Analyzer::new(Arc::new(toy_classifier()), &config)
            .err()
            .unwrap();
        assert!(matches!(err, SetupError::Model(_)));
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            scan_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
