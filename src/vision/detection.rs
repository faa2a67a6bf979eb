//! Plate region detection
//!
//! Finds candidate plate regions in a photograph and picks the one the rest
//! of the pipeline works on.

use anyhow::Result;
use image::RgbImage;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::cascade::{group_rectangles, HaarCascade};
use super::preprocess::luma;
use super::DetectionRegion;
use crate::config::DetectorConfig;

/// Stage that proposes plate regions
pub trait PlateDetector: Send + Sync {
    /// Candidate regions in detector output order; empty when no plate is seen
    fn detect(&self, image: &RgbImage) -> Vec<DetectionRegion>;
}

impl<T: PlateDetector + ?Sized> PlateDetector for Arc<T> {
    fn detect(&self, image: &RgbImage) -> Vec<DetectionRegion> {
        (**self).detect(image)
    }
}

/// Rule for choosing one region among several candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Last region in detector output order
    #[default]
    Last,
    /// Region with the largest area; the earliest wins ties
    Largest,
}

/// Choose the region that downstream stages will read
pub fn select_region(
    regions: &[DetectionRegion],
    policy: SelectionPolicy,
) -> Option<DetectionRegion> {
    match policy {
        SelectionPolicy::Last => regions.last().copied(),
        SelectionPolicy::Largest => regions
            .iter()
            .copied()
            .reduce(|best, r| if r.area() > best.area() { r } else { best }),
    }
}

/// Haar cascade scanned over an image pyramid
pub struct CascadePlateDetector {
    cascade: HaarCascade,
    scale_factor: f64,
    min_neighbors: u32,
    group_eps: f64,
}

impl CascadePlateDetector {
    pub fn new(cascade: HaarCascade, config: &DetectorConfig) -> Self {
        Self {
            cascade,
            scale_factor: config.scale_factor,
            min_neighbors: config.min_neighbors,
            group_eps: config.group_eps,
        }
    }

    /// Load the cascade named in the configuration
    pub fn from_config(config: &DetectorConfig) -> Result<Self> {
        let cascade = HaarCascade::from_file(&config.cascade_path)?;
        Ok(Self::new(cascade, config))
    }

    pub fn cascade(&self) -> &HaarCascade {
        &self.cascade
    }
}

impl PlateDetector for CascadePlateDetector {
    fn detect(&self, image: &RgbImage) -> Vec<DetectionRegion> {
        let start = Instant::now();
        let gray = luma(image);

        let hits = self.cascade.scan(&gray, self.scale_factor);
        let grouped = group_rectangles(&hits, self.min_neighbors, self.group_eps);

        let regions: Vec<DetectionRegion> = grouped
            .iter()
            .filter_map(|r| region_within(r, image.width(), image.height()))
            .collect();

        debug!(
            "Detection: {} raw hits, {} regions in {:?}",
            hits.len(),
            regions.len(),
            start.elapsed()
        );
        regions
    }
}

/// Part of `rect` inside a `width` x `height` image, `None` when empty
fn region_within(rect: &Rect, width: u32, height: u32) -> Option<DetectionRegion> {
    let x0 = i64::from(rect.left()).max(0);
    let y0 = i64::from(rect.top()).max(0);
    let x1 = (i64::from(rect.left()) + i64::from(rect.width())).min(i64::from(width));
    let y1 = (i64::from(rect.top()) + i64::from(rect.height())).min(i64::from(height));
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(DetectionRegion::new(
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    ))
}
