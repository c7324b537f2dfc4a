//! Turns saliency maps into viewable JPEG data URIs.
//!
//! Both renderings are pure functions of their inputs: the color table is
//! fixed and the JPEG encoder runs at a pinned quality, so equal inputs give
//! byte-identical payloads.

use std::io::Cursor;
use std::sync::OnceLock;

use base64::{engine::general_purpose, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::Deserialize;

use crate::error::{ConfigError, RenderError};
use crate::explain::SaliencyMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Weight of the heatmap when composited over the scan.
    pub alpha: f32,
    pub jpeg_quality: u8,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            alpha: 0.4,
            jpeg_quality: 95,
        }
    }
}

static JET: OnceLock<[Rgb<u8>; 256]> = OnceLock::new();

/// Jet color map: dark blue through cyan, yellow and red to dark red.
pub fn jet(intensity: u8) -> Rgb<u8> {
    let table = JET.get_or_init(|| {
        std::array::from_fn(|i| {
            let x = i as f32 / 255.0;
            let channel = |center: f32| {
                let v = (1.5 - (4.0 * x - center).abs()).clamp(0.0, 1.0);
                (v * 255.0).round() as u8
            };
            Rgb([channel(3.0), channel(2.0), channel(1.0)])
        })
    });
    table[intensity as usize]
}

/// Wraps `bytes` as a base64 `data:` URI.
pub fn to_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", general_purpose::STANDARD.encode(bytes))
}

#[derive(Debug, Clone)]
pub struct HeatmapRenderer {
    config: RenderConfig,
    size: u32,
}

impl HeatmapRenderer {
    /// `size` is the side of the square images produced.
    pub fn new(config: RenderConfig, size: u32) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&config.alpha) {
            return Err(ConfigError::OutOfRange {
                key: "render_alpha",
                message: format!("{} is outside [0, 1]", config.alpha),
            });
        }
        if !(1..=100).contains(&config.jpeg_quality) {
            return Err(ConfigError::OutOfRange {
                key: "render_jpeg_quality",
                message: format!("{} is outside [1, 100]", config.jpeg_quality),
            });
        }
        if size == 0 {
            return Err(ConfigError::OutOfRange {
                key: "render_size",
                message: "rendered images need a positive size".to_string(),
            });
        }
        Ok(Self { config, size })
    }

    pub fn render_heatmap_only(&self, map: &SaliencyMap) -> Result<String, RenderError> {
        let heatmap = self.colorize(map);
        self.encode(&heatmap)
    }

    pub fn render_overlay(
        &self,
        original: &[u8],
        map: &SaliencyMap,
    ) -> Result<String, RenderError> {
        let original = image::load_from_memory(original)
            .map_err(RenderError::Decode)?
            .to_rgb8();
        let original = imageops::resize(&original, self.size, self.size, FilterType::Triangle);
        let heatmap = self.colorize(map);
        self.encode(&blend(&original, &heatmap, self.config.alpha))
    }

    /// Jet-colored map at the renderer's size.
    fn colorize(&self, map: &SaliencyMap) -> RgbImage {
        let (height, width) = map.dims();
        let values = map.values();
        let colored = RgbImage::from_fn(width as u32, height as u32, |x, y| {
            let v = values[[y as usize, x as usize]].clamp(0.0, 1.0);
            jet((v * 255.0) as u8)
        });
        if colored.dimensions() == (self.size, self.size) {
            colored
        } else {
            imageops::resize(&colored, self.size, self.size, FilterType::Triangle)
        }
    }

    fn encode(&self, image: &RgbImage) -> Result<String, RenderError> {
        let mut buffer = Cursor::new(Vec::new());
        JpegEncoder::new_with_quality(&mut buffer, self.config.jpeg_quality)
            .encode_image(image)
            .map_err(RenderError::Encode)?;
        Ok(to_data_uri("image/jpeg", buffer.get_ref()))
    }
}

/// `alpha * heatmap + (1 - alpha) * original`, clamped per channel.
pub(crate) fn blend(original: &RgbImage, heatmap: &RgbImage, alpha: f32) -> RgbImage {
    RgbImage::from_fn(original.width(), original.height(), |x, y| {
        let o = original.get_pixel(x, y).0;
        let h = heatmap.get_pixel(x, y).0;
        Rgb(std::array::from_fn(|c| {
            (alpha * h[c] as f32 + (1.0 - alpha) * o[c] as f32)
                .round()
                .clamp(0.0, 255.0) as u8
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use tract_onnx::prelude::tract_ndarray::Array2;

    fn gradient_map(size: u32) -> SaliencyMap {
        let n = size as usize;
        SaliencyMap::from_values(Array2::from_shape_fn((n, n), |(y, x)| {
            (x + y) as f32 / (2 * (n - 1)) as f32
        }))
    }

    fn png_scan() -> Vec<u8> {
        let scan = GrayImage::from_fn(64, 64, |x, y| {
            if (x as f32 - 32.0).hypot(y as f32 - 32.0) < 20.0 {
                Luma([180])
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

    fn decode(uri: &str) -> RgbImage {
        let payload = uri.strip_prefix("data:image/jpeg;base64,").unwrap();
        let bytes = general_purpose::STANDARD.decode(payload).unwrap();
        image::load_from_memory(&bytes).unwrap().to_rgb8()
    }

    #[test]
    fn jet_runs_from_blue_to_red() {
        assert_eq!(jet(0), Rgb([0, 0, 128]));
        assert_eq!(jet(255), Rgb([128, 0, 0]));
        let middle = jet(128);
        assert!(middle.0[1] > 200);
    }

    #[test]
    fn blend_clamps_instead_of_wrapping() {
        let original = RgbImage::from_pixel(1, 1, Rgb([255, 10, 0]));
        let heatmap = RgbImage::from_pixel(1, 1, Rgb([255, 0, 255]));
        let blended = blend(&original, &heatmap, 0.4);
        assert_eq!(blended.get_pixel(0, 0), &Rgb([255, 6, 102]));
    }

    #[test]
    fn renderings_are_deterministic_data_uris() {
        let renderer = HeatmapRenderer::new(RenderConfig::default(), 32).unwrap();
        let map = gradient_map(32);
        let first = renderer.render_heatmap_only(&map).unwrap();
        let second = renderer.render_heatmap_only(&map).unwrap();
        assert!(first.starts_with("data:image/jpeg;base64,"));
        assert_eq!(first, second);

        let scan = png_scan();
        let overlay = renderer.render_overlay(&scan, &map).unwrap();
        assert_eq!(overlay, renderer.render_overlay(&scan, &map).unwrap());
        assert_ne!(overlay, first);
        assert_eq!(decode(&overlay).dimensions(), (32, 32));
    }

    #[test]
    fn small_maps_are_resized_to_output_size() {
        let renderer = HeatmapRenderer::new(RenderConfig::default(), 48).unwrap();
        let image = decode(&renderer.render_heatmap_only(&gradient_map(8)).unwrap());
        assert_eq!(image.dimensions(), (48, 48));
    }

    #[test]
    fn overlay_of_garbage_is_a_decode_error() {
        let renderer = HeatmapRenderer::new(RenderConfig::default(), 16).unwrap();
        let err = renderer
            .render_overlay(b"garbage", &SaliencyMap::zeros(16))
            .unwrap_err();
        assert!(matches!(err, RenderError::Decode(_)));
    }

    #[test]
    fn rejects_out_of_range_settings() {
        let config = RenderConfig {
            alpha: 1.5,
            ..RenderConfig::default()
        };
        assert!(HeatmapRenderer::new(config, 224).is_err());
        let config = RenderConfig {
            jpeg_quality: 0,
            ..RenderConfig::default()
        };
        assert!(HeatmapRenderer::new(config, 224).is_err());
    }
}
