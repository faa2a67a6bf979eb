//! Plate normalization
//!
//! Turns the selected plate crop into a canonical binary raster: fixed size,
//! Otsu-binarized, opened by one erosion and one dilation, with a forced
//! background border so glyphs never touch the raster edge.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::map::map_colors;
use imageproc::morphology::{dilate, erode};
use tracing::debug;

use super::DetectionRegion;
use crate::config::NormalizationConfig;

/// Background level of a binarized plate
pub const BACKGROUND: u8 = 255;

/// Canonical binary plate raster
///
/// `rows` and `cols` are the raster's own pixel counts (height and width).
/// Every geometric threshold downstream is a fraction of one of them.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryPlate {
    pub raster: GrayImage,
    pub rows: u32,
    pub cols: u32,
}

impl BinaryPlate {
    pub fn new(raster: GrayImage) -> Self {
        let (cols, rows) = raster.dimensions();
        Self { raster, rows, cols }
    }
}

/// BT.601 luma (0.299, 0.587, 0.114) in 14-bit fixed point with rounding
///
/// Cascade models are trained on this conversion. `imageops::grayscale`
/// uses Rec.709 weights instead.
pub fn luma(image: &RgbImage) -> GrayImage {
    const R: u32 = 4899;
    const G: u32 = 9617;
    const B: u32 = 1868;
    const SHIFT: u32 = 14;

    map_colors(image, |Rgb([r, g, b]): Rgb<u8>| {
        let weighted = r as u32 * R + g as u32 * G + b as u32 * B + (1 << (SHIFT - 1));
        Luma([(weighted >> SHIFT) as u8])
    })
}

/// Crop, resize and binarize the plate region
///
/// Returns `None` when the region does not intersect the image.
pub fn normalize(
    image: &RgbImage,
    region: DetectionRegion,
    config: &NormalizationConfig,
) -> Option<BinaryPlate> {
    let crop = region.clamp_to(image.width(), image.height())?;

    let plate = imageops::crop_imm(image, crop.x, crop.y, crop.width, crop.height).to_image();
    let resized = imageops::resize(&plate, config.width, config.height, FilterType::Triangle);
    let gray = luma(&resized);

    let level = otsu_level(&gray);
    let binary = map_colors(&gray, |p: Luma<u8>| {
        Luma([if p[0] > level { BACKGROUND } else { 0 }])
    });

    let opened = dilate(&erode(&binary, Norm::LInf, 1), Norm::LInf, 1);
    let raster = force_border(opened, config.border);

    debug!(
        "Normalized {}x{} crop at ({}, {}), Otsu level {}",
        crop.width, crop.height, crop.x, crop.y, level
    );
    Some(BinaryPlate::new(raster))
}

/// Set a band of `border` pixels on every side to background
pub fn force_border(mut raster: GrayImage, border: u32) -> GrayImage {
    let (width, height) = raster.dimensions();
    for (x, y, pixel) in raster.enumerate_pixels_mut() {
        if x < border || y < border || x + border >= width || y + border >= height {
            *pixel = Luma([BACKGROUND]);
        }
    }
    raster
}
