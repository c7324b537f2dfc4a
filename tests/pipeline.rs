mod common;

use std::fs;
use std::sync::Arc;
use std::thread;

use base64::{engine::general_purpose, Engine as _};
use mri_gradcam::analysis::scan_digest;
use mri_gradcam::{AnalysisResponse, Analyzer, AnalyzerConfig, TUMOR_LABELS};

fn analyzer_from_disk() -> (tempfile::TempDir, Analyzer) {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("manifest.json");
    fs::write(&manifest, common::toy_manifest().to_string()).unwrap();

    let mut config = AnalyzerConfig::default();
    config.model.manifest = manifest;
    let analyzer = Analyzer::from_config(&config).unwrap();
    (dir, analyzer)
}

fn jpeg_payload(uri: &str) -> Vec<u8> {
    let payload = uri.strip_prefix("data:image/jpeg;base64,").unwrap();
    general_purpose::STANDARD.decode(payload).unwrap()
}

#[test]
fn synthetic_scan_is_classified_and_explained() {
    let (_dir, analyzer) = analyzer_from_disk();
    let response = analyzer.analyze(&common::disk_scan(200)).unwrap();

    assert!(response.verified);
    assert!(response.error.is_none());
    let label = response.tumor_type.as_deref().unwrap();
    assert!(TUMOR_LABELS.contains(&label));
    assert_eq!(response.is_tumor, label != "No Tumor");

    let probability = response.probability.unwrap();
    assert!((0.0..=1.0).contains(&probability));
    assert!(response.confidence <= 100);
    assert_eq!(response.confidence, (probability * 100.0).round() as u8);

    let heatmap = jpeg_payload(response.gradcam_heatmap.as_deref().unwrap());
    let overlay = jpeg_payload(response.overlay_image.as_deref().unwrap());
    assert!(!heatmap.is_empty() && !overlay.is_empty());
    assert_eq!(response.heatmap, response.overlay_image);

    let decoded = image::load_from_memory(&overlay).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (224, 224));
}

#[test]
fn heatmaps_differ_when_the_scan_differs() {
    let (_dir, analyzer) = analyzer_from_disk();
    let dim = analyzer.analyze(&common::disk_scan(50)).unwrap();
    let bright = analyzer.analyze(&common::disk_scan(200)).unwrap();

    let dim_hash = scan_digest(dim.gradcam_heatmap.unwrap().as_bytes());
    let bright_hash = scan_digest(bright.gradcam_heatmap.unwrap().as_bytes());
    assert_ne!(dim_hash, bright_hash);
    assert_ne!(dim.overlay_image, bright.overlay_image);
}

#[test]
fn repeated_requests_are_independent() {
    let (_dir, analyzer) = analyzer_from_disk();
    let first = analyzer.analyze(&common::disk_scan(200)).unwrap();
    analyzer.analyze(&common::disk_scan(50)).unwrap();
    let again = analyzer.analyze(&common::disk_scan(200)).unwrap();
    assert_eq!(first, again);
    assert_eq!(analyzer.classifier().attached_hooks(), 0);
}

#[test]
fn concurrent_requests_match_sequential_ones() {
    let (_dir, analyzer) = analyzer_from_disk();
    let analyzer = Arc::new(analyzer);
    let intensities = [50u8, 120, 200, 250];
    let expected: Vec<AnalysisResponse> = intensities
        .iter()
        .map(|&i| analyzer.analyze(&common::disk_scan(i)).unwrap())
        .collect();

    let handles: Vec<_> = intensities
        .iter()
        .map(|&i| {
            let analyzer = Arc::clone(&analyzer);
            thread::spawn(move || analyzer.analyze(&common::disk_scan(i)).unwrap())
        })
        .collect();
    for (handle, expected) in handles.into_iter().zip(expected) {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn rejected_scans_get_a_structured_payload() {
    let (_dir, analyzer) = analyzer_from_disk();
    let response = analyzer.analyze(&common::color_photo()).unwrap();
    assert!(!response.verified);
    assert_eq!(response.confidence, 0);
    assert!(!response.is_tumor);
    assert_eq!(
        response.error.as_deref(),
        Some("Invalid MRI Scan: Image appears to be a color photograph, not an MRI")
    );

    let json = serde_json::to_value(&response).unwrap();
    for absent in ["tumor_type", "probability", "gradcam_heatmap", "overlay_image"] {
        assert!(json.get(absent).is_none(), "{absent} should be omitted");
    }
}

#[test]
fn response_json_round_trips() {
    let (_dir, analyzer) = analyzer_from_disk();
    let response = analyzer.analyze(&common::disk_scan(120)).unwrap();
    let text = serde_json::to_string(&response).unwrap();
    let parsed: AnalysisResponse = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed, response);
    assert!(text.contains("\"verified\":true"));
}

#[test]
fn unknown_target_layer_fails_setup() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("manifest.json");
    fs::write(&manifest, common::toy_manifest().to_string()).unwrap();

    let mut config = AnalyzerConfig::default();
    config.model.manifest = manifest;
    config.model.target_layer = "layer3".to_string();
    assert!(Analyzer::from_config(&config).is_err());
}

#[test]
fn bundled_demo_model_loads_and_serves() {
    let mut config = AnalyzerConfig::default();
    config.model.manifest =
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("model/manifest.json");
    let analyzer = Analyzer::from_config(&config).unwrap();
    assert_eq!(analyzer.classifier().labels(), TUMOR_LABELS.as_slice());
    assert!(analyzer.analyze(&common::disk_scan(200)).unwrap().verified);
}
