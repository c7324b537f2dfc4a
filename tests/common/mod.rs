use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use serde_json::{json, Value};

/// 224x224 PNG: black frame with a centered disk of radius 80.
pub fn disk_scan(intensity: u8) -> Vec<u8> {
    let scan = GrayImage::from_fn(224, 224, |x, y| {
        if (x as f32 - 112.0).hypot(y as f32 - 112.0) < 80.0 {
            Luma([intensity])
        } else {
            Luma([0])
        }
    });
    encode(DynamicImage::ImageLuma8(scan))
}

pub fn color_photo() -> Vec<u8> {
    let photo = RgbImage::from_fn(160, 160, |x, y| match (x / 20 + y / 20) % 3 {
        0 => Rgb([230, 40, 20]),
        1 => Rgb([30, 200, 60]),
        _ => Rgb([20, 60, 240]),
    });
    encode(DynamicImage::ImageRgb8(photo))
}

pub fn encode(image: DynamicImage) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

/// Manifest of a small head-only classifier with a `layer4` spatial block.
pub fn toy_manifest() -> Value {
    let conv_weights: Vec<f32> = (0..54)
        .map(|i| if i < 27 { 1.0 / 27.0 } else { -1.0 / 27.0 })
        .collect();
    let fc_weights: Vec<f32> = (0..4)
        .flat_map(|c| {
            let c = c as f32;
            [1.0 + 0.1 * c, 0.2 - 0.1 * c]
        })
        .collect();
    json!({
        "labels": ["Glioma", "Meningioma", "No Tumor", "Pituitary"],
        "input_size": 224,
        "layers": [
            { "kind": "max_pool2d", "name": "stem", "kernel_size": 4 },
            {
                "kind": "conv2d",
                "name": "conv1",
                "in_channels": 3,
                "out_channels": 2,
                "kernel_size": 3,
                "padding": 1,
                "weights": conv_weights,
                "bias": [2.5, 0.5]
            },
            { "kind": "relu", "name": "relu1" },
            { "kind": "max_pool2d", "name": "layer4", "kernel_size": 2 },
            { "kind": "global_avg_pool", "name": "avgpool" },
            {
                "kind": "linear",
                "name": "fc",
                "in_features": 2,
                "out_features": 4,
                "weights": fc_weights,
                "bias": [0.0, 0.1, -0.1, 0.05]
            }
        ]
    })
}
