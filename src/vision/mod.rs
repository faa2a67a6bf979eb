//! Vision Layer
//!
//! Raster stages of plate recognition:
//! - Plate region detection (Haar cascade) and selection
//! - Normalization of the plate crop to a canonical binary raster
//! - Glyph segmentation and classification (ONNX Runtime)
//! - Annotation of the source image

pub mod annotate;
pub mod cascade;
pub mod detection;
pub mod models;
pub mod preprocess;
pub mod segmentation;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::RecognitionError;

pub use annotate::ResultComposer;
pub use cascade::HaarCascade;
pub use detection::{select_region, CascadePlateDetector, PlateDetector, SelectionPolicy};
pub use models::{Alphabet, GlyphClassifier, OnnxGlyphClassifier, OnnxSession};
pub use preprocess::{normalize, BinaryPlate};
pub use segmentation::{segment, GlyphCandidate};

/// Axis-aligned plate region in source image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetectionRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl DetectionRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersection with a `width` x `height` image, `None` when empty
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<DetectionRegion> {
        let x0 = self.x.min(width);
        let y0 = self.y.min(height);
        let x1 = self.x.saturating_add(self.width).min(width);
        let y1 = self.y.saturating_add(self.height).min(height);
        (x1 > x0 && y1 > y0).then(|| DetectionRegion::new(x0, y0, x1 - x0, y1 - y0))
    }
}

/// Decode raw image bytes into the 3-channel raster the pipeline works on
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, RecognitionError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(RecognitionError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_clamp_inside() {
        let region = DetectionRegion::new(10, 10, 20, 5);
        assert_eq!(region.clamp_to(100, 100), Some(region));
    }

    #[test]
    fn test_clamp_overhanging() {
        let region = DetectionRegion::new(90, 95, 20, 10);
        assert_eq!(
            region.clamp_to(100, 100),
            Some(DetectionRegion::new(90, 95, 10, 5))
        );
    }

    #[test]
    fn test_clamp_outside() {
        let region = DetectionRegion::new(120, 0, 20, 10);
        assert_eq!(region.clamp_to(100, 100), None);
    }

    #[test]
    fn test_decode_png() {
        let img = RgbImage::from_pixel(4, 3, image::Rgb([10, 20, 30]));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();

        let decoded = decode_image(&bytes).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_decode_garbage() {
        let result = decode_image(b"definitely not an image");
        assert!(matches!(result, Err(RecognitionError::Decode(_))));
    }
}
