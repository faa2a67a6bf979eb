//! Glyph segmentation
//!
//! Extracts character-sized blobs from a binary plate. Every contour of the
//! raster is considered (outer and hole borders alike), since dark glyphs on
//! a light plate show up as holes of the background region.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::contours::find_contours;
use imageproc::point::Point;
use tracing::debug;

use super::preprocess::BinaryPlate;
use crate::config::SegmentationConfig;

/// Isolated glyph ready for classification
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphCandidate {
    /// Left edge of the glyph on the binary plate
    pub x_position: u32,
    /// Inverted glyph (light on dark) centered in a dark canvas
    pub raster: GrayImage,
}

/// Axis-aligned bounds of a contour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Extract glyph candidates sorted left to right
///
/// Contours are ranked by enclosed area and only the `max_contours` largest
/// are examined. A fully white border yields no plate-frame contour, so the
/// budget is spent on glyph-level contours only.
///
/// A bounding box is kept when its width lies strictly within the width
/// bounds (fractions of `rows`) and its height strictly within the height
/// bounds (fractions of `cols`).
pub fn segment(plate: &BinaryPlate, config: &SegmentationConfig) -> Vec<GlyphCandidate> {
    let contours = find_contours::<u32>(&plate.raster);
    let total = contours.len();

    let mut ranked: Vec<(f64, Bounds)> = contours
        .iter()
        .filter_map(|c| Some((polygon_area(&c.points), bounding_box(&c.points)?)))
        .collect();
    // Stable: equal areas keep extraction order.
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.truncate(config.max_contours);

    let rows = plate.rows as f32;
    let cols = plate.cols as f32;
    let (w_lo, w_hi) = (rows * config.width_bounds.0, rows * config.width_bounds.1);
    let (h_lo, h_hi) = (cols * config.height_bounds.0, cols * config.height_bounds.1);

    let mut glyphs: Vec<GlyphCandidate> = ranked
        .into_iter()
        .map(|(_, bounds)| bounds)
        .filter(|b| {
            let (w, h) = (b.width as f32, b.height as f32);
            w_lo < w && w < w_hi && h_lo < h && h < h_hi
        })
        .map(|b| GlyphCandidate {
            x_position: b.x,
            raster: glyph_canvas(&plate.raster, b, config),
        })
        .collect();

    glyphs.sort_by_key(|g| g.x_position);

    debug!(
        "Segmentation: {} contours, {} glyphs at x = {:?}",
        total,
        glyphs.len(),
        glyphs.iter().map(|g| g.x_position).collect::<Vec<_>>()
    );
    glyphs
}

/// Crop, resize and invert a glyph, then center it on a dark canvas
fn glyph_canvas(raster: &GrayImage, b: Bounds, config: &SegmentationConfig) -> GrayImage {
    let crop = imageops::crop_imm(raster, b.x, b.y, b.width, b.height).to_image();
    let mut glyph = imageops::resize(
        &crop,
        config.glyph_width,
        config.glyph_height,
        FilterType::Triangle,
    );
    imageops::invert(&mut glyph);

    let mut canvas =
        GrayImage::from_pixel(config.canvas_width(), config.canvas_height(), Luma([0]));
    imageops::replace(
        &mut canvas,
        &glyph,
        config.canvas_border as i64,
        config.canvas_border as i64,
    );
    canvas
}

/// Shoelace area of a closed polygon
fn polygon_area(points: &[Point<u32>]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let twice: i64 = points
        .iter()
        .zip(points.iter().cycle().skip(1))
        .map(|(p, q)| p.x as i64 * q.y as i64 - q.x as i64 * p.y as i64)
        .sum();
    twice.abs() as f64 / 2.0
}

fn bounding_box(points: &[Point<u32>]) -> Option<Bounds> {
    let min_x = points.iter().map(|p| p.x).min()?;
    let max_x = points.iter().map(|p| p.x).max()?;
    let min_y = points.iter().map(|p| p.y).min()?;
    let max_y = points.iter().map(|p| p.y).max()?;
    Some(Bounds {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}
