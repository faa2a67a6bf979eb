//! Result annotation
//!
//! Draws the detected plate border and the recognized text on a copy of the
//! source photograph.

use ab_glyph::FontVec;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::{debug, info, warn};

use super::DetectionRegion;
use crate::config::OutputConfig;

/// Plate border when a region was found
pub const FOUND_COLOR: Rgb<u8> = Rgb([155, 181, 51]);
/// Plate border redrawn when the text failed validation
pub const REJECTED_COLOR: Rgb<u8> = Rgb([200, 0, 0]);
/// Text panel fill
pub const PANEL_COLOR: Rgb<u8> = Rgb([220, 220, 220]);
/// Text of a recognized plate
pub const SUCCESS_COLOR: Rgb<u8> = Rgb([0, 155, 0]);
/// Text of an unrecognized plate
pub const FAILURE_COLOR: Rgb<u8> = Rgb([200, 0, 0]);

const BORDER_THICKNESS: i32 = 3;
// Text baseline sits this far from the left and bottom edges.
const TEXT_MARGIN: i32 = 50;
const PANEL_PAD_X: i32 = 10;
const PANEL_PAD_TOP: i32 = 20;
const PANEL_PAD_BOTTOM: i32 = 4;

const SYSTEM_FONTS: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Renders recognition results onto images
pub struct ResultComposer {
    font: Option<FontVec>,
    font_scale: f32,
}

impl ResultComposer {
    pub fn new(font: Option<FontVec>, font_scale: f32) -> Self {
        Self { font, font_scale }
    }

    /// Use the configured font, falling back to common system fonts
    pub fn from_config(config: &OutputConfig) -> Self {
        let configured = config.font_path.as_deref().and_then(|path| {
            let font = load_font(path);
            if font.is_none() {
                warn!("Could not load font {:?}, trying system fonts", path);
            }
            font
        });

        let font = configured.or_else(|| {
            SYSTEM_FONTS
                .iter()
                .find_map(|path| load_font(Path::new(path)))
        });
        if font.is_none() {
            warn!("No usable font found, plate text will not be rendered");
        }

        Self::new(font, config.font_scale)
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Annotate a copy of `image`
    ///
    /// Without a region the copy is returned untouched.
    pub fn compose(
        &self,
        image: &RgbImage,
        region: Option<DetectionRegion>,
        text: &str,
        recognized: bool,
    ) -> RgbImage {
        let mut canvas = image.clone();
        let Some(region) = region else {
            return canvas;
        };

        draw_plate_border(&mut canvas, region, FOUND_COLOR);
        if !recognized {
            draw_plate_border(&mut canvas, region, REJECTED_COLOR);
        }
        self.draw_text_panel(&mut canvas, text, recognized);

        canvas
    }

    fn draw_text_panel(&self, canvas: &mut RgbImage, text: &str, recognized: bool) {
        let (text_w, text_h) = match &self.font {
            Some(font) => text_size(self.font_scale, font, text),
            // Rough advance of a bold sans face
            None => (
                (text.chars().count() as f32 * self.font_scale * 0.6) as u32,
                self.font_scale as u32,
            ),
        };
        let (text_w, text_h) = (text_w as i32, text_h.max(1) as i32);

        let baseline_x = TEXT_MARGIN;
        let baseline_y = canvas.height() as i32 - TEXT_MARGIN;
        let text_top = baseline_y - text_h;

        let panel = Rect::at(baseline_x - PANEL_PAD_X, text_top - PANEL_PAD_TOP).of_size(
            (text_w + 2 * PANEL_PAD_X) as u32,
            (text_h + PANEL_PAD_TOP + PANEL_PAD_BOTTOM) as u32,
        );
        draw_filled_rect_mut(canvas, panel, PANEL_COLOR);

        let Some(font) = &self.font else {
            debug!("No font loaded, skipping plate text");
            return;
        };
        let color = if recognized { SUCCESS_COLOR } else { FAILURE_COLOR };
        draw_text_mut(canvas, color, baseline_x, text_top, self.font_scale, font, text);
    }
}

/// Border inset from the region: 2 px on the left, 2 on the right, 4 at the bottom
fn draw_plate_border(canvas: &mut RgbImage, region: DetectionRegion, color: Rgb<u8>) {
    let left = region.x as i32 + 2;
    let top = region.y as i32;
    let right = region.x as i32 + region.width as i32 - 3;
    let bottom = region.y as i32 + region.height as i32 - 5;
    if right <= left || bottom <= top {
        return;
    }

    // Thickness grows evenly around the nominal edge.
    let half = BORDER_THICKNESS / 2;
    for offset in -half..=half {
        let width = right - left + 1 + 2 * offset;
        let height = bottom - top + 1 + 2 * offset;
        if width <= 0 || height <= 0 {
            continue;
        }
        let rect = Rect::at(left - offset, top - offset).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

fn load_font(path: &Path) -> Option<FontVec> {
    let data = std::fs::read(path).ok()?;
    let font = FontVec::try_from_vec(data).ok()?;
    info!("Loaded font: {:?}", path);
    Some(font)
}
