//! Haar cascade evaluation
//!
//! A boosted cascade of decision-tree stages over rectangle features, scanned
//! over a pyramid of downscaled images. Each window is variance-normalized
//! using integral and squared-integral images. Raw hits are merged with the
//! neighbour-counting rectangle grouping used by the classic Viola-Jones
//! detectors, so `min_neighbors` and `eps` have their usual meaning.
//!
//! Cascades trained with OpenCV are read from their XML storage format
//! (`opencv_traincascade` output with `HAAR` features). The same model can
//! also be described in JSON:
//!
//! ```json
//! {
//!   "window_width": 60, "window_height": 20,
//!   "features": [ { "rects": [ { "x": 0, "y": 0, "width": 4, "height": 2, "weight": -1.0 } ] } ],
//!   "stages": [ { "threshold": -1.2, "weak_classifiers": [
//!       { "nodes": [ { "left": 0, "right": -1, "feature": 0, "threshold": 0.01 } ],
//!         "leaf_values": [ -0.8, 0.6 ] } ] } ]
//! }
//! ```
//!
//! A child index greater than zero points to another node of the same tree,
//! an index `i <= 0` selects `leaf_values[-i]`.

use anyhow::{ensure, Context, Result};
use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

use crate::error::CascadeError;

// Stage thresholds are relaxed by this amount when compared.
const STAGE_THRESHOLD_EPS: f64 = 1e-5;

/// Weighted rectangle of a feature, in window coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

/// Haar-like feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub rects: Vec<WeightedRect>,
    /// 45-degree features; not supported by this evaluator
    #[serde(default)]
    pub tilted: bool,
}

/// Split node of a weak classifier tree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Child taken when the feature value is below `threshold`
    pub left: i32,
    /// Child taken otherwise
    pub right: i32,
    pub feature: usize,
    pub threshold: f32,
}

/// Decision tree voting with leaf values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaf_values: Vec<f32>,
}

/// Boosted stage; a window is rejected when its vote sum is below `threshold`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f32,
    pub weak_classifiers: Vec<WeakClassifier>,
}

/// Trained cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<Feature>,
}

impl HaarCascade {
    /// Load and validate a cascade description
    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading cascade from {:?}", path);

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cascade file {:?}", path))?;
        let is_xml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
        let cascade = if is_xml {
            Self::from_opencv_xml(&content)
        } else {
            Self::from_json(&content)
        }
        .with_context(|| format!("Invalid cascade file {:?}", path))?;

        info!(
            "Cascade loaded: {} stages, {} features, window {}x{}",
            cascade.stages.len(),
            cascade.features.len(),
            cascade.window_width,
            cascade.window_height
        );
        Ok(cascade)
    }

    /// Parse and validate a cascade from JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let cascade: HaarCascade =
            serde_json::from_str(json).context("Failed to parse cascade JSON")?;
        cascade.validate()?;
        Ok(cascade)
    }

    /// Parse and validate a cascade from OpenCV XML storage
    ///
    /// Only boosted cascades over ordered (non-categorical) Haar features are
    /// accepted; the legacy `<trees>` layout is not.
    pub fn from_opencv_xml(xml: &str) -> Result<Self> {
        let storage: xml::Storage =
            quick_xml::de::from_str(xml).context("Failed to parse cascade XML")?;
        let source = storage.cascade;

        if let Some(kind) = &source.feature_type {
            ensure!(
                kind.eq_ignore_ascii_case("HAAR"),
                "unsupported feature type {kind:?}"
            );
        }
        if let Some(params) = &source.feature_params {
            ensure!(
                params.max_cat_count == 0,
                "categorical features are not supported"
            );
        }

        let mut stages = Vec::with_capacity(source.stages.items.len());
        for (stage_index, stage) in source.stages.items.iter().enumerate() {
            let weak_classifiers = stage
                .weak_classifiers
                .items
                .iter()
                .map(xml::weak_classifier)
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("stage {stage_index}"))?;
            stages.push(Stage {
                threshold: stage.stage_threshold,
                weak_classifiers,
            });
        }

        let features = source
            .features
            .items
            .iter()
            .enumerate()
            .map(|(index, f)| xml::feature(f).with_context(|| format!("feature {index}")))
            .collect::<Result<Vec<_>>>()?;

        let cascade = HaarCascade {
            window_width: source.width,
            window_height: source.height,
            stages,
            features,
        };
        cascade.validate()?;
        Ok(cascade)
    }

    /// Check structural consistency so evaluation never indexes out of range
    pub fn validate(&self) -> Result<(), CascadeError> {
        if self.stages.is_empty() {
            return Err(CascadeError::Empty);
        }
        if self.window_width < 3 || self.window_height < 3 {
            return Err(CascadeError::WindowTooSmall {
                width: self.window_width,
                height: self.window_height,
            });
        }

        for (index, feature) in self.features.iter().enumerate() {
            if feature.tilted {
                return Err(CascadeError::TiltedFeature { feature: index });
            }
            let inside = feature.rects.iter().all(|r| {
                r.x + r.width <= self.window_width && r.y + r.height <= self.window_height
            });
            if !inside {
                return Err(CascadeError::RectOutOfWindow { feature: index });
            }
        }

        for (stage_index, stage) in self.stages.iter().enumerate() {
            for weak in &stage.weak_classifiers {
                if weak.nodes.is_empty() {
                    return Err(CascadeError::BrokenTree {
                        stage: stage_index,
                        what: "node",
                        index: 0,
                    });
                }
                for (node_index, node) in weak.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        return Err(CascadeError::MissingFeature {
                            stage: stage_index,
                            feature: node.feature,
                        });
                    }
                    for child in [node.left, node.right] {
                        if child > 0 {
                            // Children must come later so every walk terminates.
                            let child_index = child as usize;
                            if child_index <= node_index || child_index >= weak.nodes.len() {
                                return Err(CascadeError::BrokenTree {
                                    stage: stage_index,
                                    what: "node",
                                    index: child,
                                });
                            }
                        } else if child.unsigned_abs() as usize >= weak.leaf_values.len() {
                            return Err(CascadeError::BrokenTree {
                                stage: stage_index,
                                what: "leaf",
                                index: child,
                            });
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Raw (ungrouped) hits over all scales
    ///
    /// Scales grow geometrically by `scale_factor` from 1 while the scaled
    /// window still fits the image. At each scale the image is downscaled
    /// instead of the window, and the window is moved with a step of 2 pixels
    /// below scale 2 and 1 pixel above.
    pub fn scan(&self, gray: &GrayImage, scale_factor: f64) -> Vec<Rect> {
        let (img_w, img_h) = gray.dimensions();
        let mut hits = Vec::new();
        let single_scale = scale_factor.is_nan() || scale_factor <= 1.0;

        let mut factor = 1.0_f64;
        loop {
            let win_w = round(self.window_width as f64 * factor);
            let win_h = round(self.window_height as f64 * factor);
            if win_w > img_w as i64 || win_h > img_h as i64 {
                break;
            }

            let scaled_w = round(img_w as f64 / factor).max(1) as u32;
            let scaled_h = round(img_h as f64 / factor).max(1) as u32;
            if scaled_w < self.window_width || scaled_h < self.window_height {
                break;
            }

            let scaled = if scaled_w == img_w && scaled_h == img_h {
                gray.clone()
            } else {
                imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle)
            };
            let before = hits.len();
            self.scan_level(&scaled, factor, win_w as i32, win_h as i32, &mut hits);
            debug!(
                "Cascade scale {:.3}: {}x{} image, {} hits",
                factor,
                scaled_w,
                scaled_h,
                hits.len() - before
            );

            if single_scale {
                break;
            }
            factor *= scale_factor;
        }

        hits
    }

    fn scan_level(
        &self,
        image: &GrayImage,
        factor: f64,
        win_w: i32,
        win_h: i32,
        hits: &mut Vec<Rect>,
    ) {
        let integrals = Integrals::new(image);
        let step = if factor >= 2.0 { 1 } else { 2 };
        let max_x = image.width() - self.window_width;
        let max_y = image.height() - self.window_height;

        let mut y = 0;
        while y <= max_y {
            let mut x = 0;
            while x <= max_x {
                match self.evaluate(&integrals, x, y) {
                    WindowVerdict::Accepted => {
                        let left = round(x as f64 * factor) as i32;
                        let top = round(y as f64 * factor) as i32;
                        hits.push(Rect::at(left, top).of_size(win_w as u32, win_h as u32));
                    }
                    // Rejected by the very first stage: skip the next position too.
                    WindowVerdict::Rejected(0) => x += step,
                    WindowVerdict::Rejected(_) => {}
                }
                x += step;
            }
            y += step;
        }
    }

    fn evaluate(&self, integrals: &Integrals, x: u32, y: u32) -> WindowVerdict {
        let norm_area = ((self.window_width - 2) * (self.window_height - 2)) as f64;
        let norm_sum = integrals.sum(x + 1, y + 1, self.window_width - 2, self.window_height - 2);
        let norm_sq = integrals.sq_sum(x + 1, y + 1, self.window_width - 2, self.window_height - 2);
        let spread = norm_area * norm_sq - norm_sum * norm_sum;
        let inv_norm = if spread > 0.0 { 1.0 / spread.sqrt() } else { 1.0 };

        for (stage_index, stage) in self.stages.iter().enumerate() {
            let mut votes = 0.0_f64;
            for weak in &stage.weak_classifiers {
                let mut node_index = 0usize;
                let leaf = loop {
                    let node = &weak.nodes[node_index];
                    let value = self.feature_value(integrals, node.feature, x, y) * inv_norm;
                    let next = if value < node.threshold as f64 {
                        node.left
                    } else {
                        node.right
                    };
                    if next <= 0 {
                        break next.unsigned_abs() as usize;
                    }
                    node_index = next as usize;
                };
                votes += weak.leaf_values[leaf] as f64;
            }
            if votes < stage.threshold as f64 - STAGE_THRESHOLD_EPS {
                return WindowVerdict::Rejected(stage_index);
            }
        }

        WindowVerdict::Accepted
    }

    fn feature_value(&self, integrals: &Integrals, feature: usize, x: u32, y: u32) -> f64 {
        self.features[feature]
            .rects
            .iter()
            .map(|r| r.weight as f64 * integrals.sum(x + r.x, y + r.y, r.width, r.height))
            .sum()
    }
}

/// OpenCV cascade storage layout
mod xml {
    use anyhow::{bail, ensure, Context, Result};
    use serde::Deserialize;

    use super::{Feature, TreeNode, WeakClassifier, WeightedRect};

    #[derive(Deserialize)]
    pub(super) struct Storage {
        pub cascade: Cascade,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Cascade {
        #[serde(default)]
        pub feature_type: Option<String>,
        #[serde(default)]
        pub feature_params: Option<FeatureParams>,
        pub width: u32,
        pub height: u32,
        pub stages: List<Stage>,
        pub features: List<RawFeature>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct FeatureParams {
        #[serde(default)]
        pub max_cat_count: u32,
    }

    /// Anonymous `<_>` items
    #[derive(Deserialize)]
    pub(super) struct List<T> {
        #[serde(rename = "_", default = "Vec::new")]
        pub items: Vec<T>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Stage {
        pub stage_threshold: f32,
        pub weak_classifiers: List<RawWeak>,
    }

    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct RawWeak {
        pub internal_nodes: String,
        pub leaf_values: String,
    }

    #[derive(Deserialize)]
    pub(super) struct RawFeature {
        pub rects: List<String>,
        #[serde(default)]
        pub tilted: u8,
    }

    /// `internalNodes` holds `left right feature threshold` per node
    pub(super) fn weak_classifier(raw: &RawWeak) -> Result<WeakClassifier> {
        let tokens: Vec<&str> = raw.internal_nodes.split_whitespace().collect();
        if tokens.is_empty() || tokens.len() % 4 != 0 {
            bail!("internalNodes has {} values, expected groups of 4", tokens.len());
        }

        let nodes = tokens
            .chunks_exact(4)
            .map(|t| {
                Ok(TreeNode {
                    left: t[0].parse().with_context(|| format!("bad child {:?}", t[0]))?,
                    right: t[1].parse().with_context(|| format!("bad child {:?}", t[1]))?,
                    feature: t[2]
                        .parse()
                        .with_context(|| format!("bad feature index {:?}", t[2]))?,
                    threshold: t[3]
                        .parse()
                        .with_context(|| format!("bad threshold {:?}", t[3]))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_values = raw
            .leaf_values
            .split_whitespace()
            .map(|v| v.parse().with_context(|| format!("bad leaf value {v:?}")))
            .collect::<Result<Vec<f32>>>()?;

        Ok(WeakClassifier { nodes, leaf_values })
    }

    /// Each rect is `x y width height weight`
    pub(super) fn feature(raw: &RawFeature) -> Result<Feature> {
        let rects = raw
            .rects
            .items
            .iter()
            .map(|text| {
                let t: Vec<&str> = text.split_whitespace().collect();
                ensure!(t.len() == 5, "rect {text:?} needs 5 values");
                Ok(WeightedRect {
                    x: t[0].parse().with_context(|| format!("bad rect {text:?}"))?,
                    y: t[1].parse().with_context(|| format!("bad rect {text:?}"))?,
                    width: t[2].parse().with_context(|| format!("bad rect {text:?}"))?,
                    height: t[3].parse().with_context(|| format!("bad rect {text:?}"))?,
                    weight: t[4].parse().with_context(|| format!("bad rect {text:?}"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Feature {
            rects,
            tilted: raw.tilted != 0,
        })
    }
}

enum WindowVerdict {
    Accepted,
    Rejected(usize),
}

/// Integral and squared-integral images of one pyramid level
struct Integrals {
    stride: usize,
    sum: Vec<u64>,
    sq_sum: Vec<u64>,
}

impl Integrals {
    fn new(image: &GrayImage) -> Self {
        let sum = integral_image::<_, u64>(image);
        let sq_sum = integral_squared_image::<_, u64>(image);
        Self {
            stride: sum.width() as usize,
            sum: sum.into_raw(),
            sq_sum: sq_sum.into_raw(),
        }
    }

    fn sum(&self, x: u32, y: u32, width: u32, height: u32) -> f64 {
        Self::rect_total(&self.sum, self.stride, x, y, width, height)
    }

    fn sq_sum(&self, x: u32, y: u32, width: u32, height: u32) -> f64 {
        Self::rect_total(&self.sq_sum, self.stride, x, y, width, height)
    }

    fn rect_total(table: &[u64], stride: usize, x: u32, y: u32, width: u32, height: u32) -> f64 {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + width as usize, y0 + height as usize);
        let total = table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0];
        total as f64
    }
}

/// Merge overlapping raw hits into averaged regions
///
/// Hits whose four edges all lie within `eps * (min width + min height) / 2`
/// of each other are clustered transitively. A cluster survives only when it
/// holds more than `min_neighbors` hits. Clusters enclosed by a
/// better-supported cluster are dropped. Output follows the order in which
/// clusters first appear in `hits`. With `min_neighbors == 0` the hits are
/// returned untouched.
pub fn group_rectangles(hits: &[Rect], min_neighbors: u32, eps: f64) -> Vec<Rect> {
    if min_neighbors == 0 || hits.is_empty() {
        return hits.to_vec();
    }

    let labels = partition(hits, eps);
    let clusters = labels.iter().copied().max().map_or(0, |m| m + 1);

    let mut totals = vec![[0i64; 4]; clusters];
    let mut counts = vec![0u32; clusters];
    for (rect, &label) in hits.iter().zip(&labels) {
        let t = &mut totals[label];
        t[0] += rect.left() as i64;
        t[1] += rect.top() as i64;
        t[2] += rect.width() as i64;
        t[3] += rect.height() as i64;
        counts[label] += 1;
    }

    let averaged: Vec<[i32; 4]> = totals
        .iter()
        .zip(&counts)
        .map(|(t, &n)| {
            let scale = 1.0 / n as f64;
            [
                round(t[0] as f64 * scale) as i32,
                round(t[1] as f64 * scale) as i32,
                round(t[2] as f64 * scale) as i32,
                round(t[3] as f64 * scale) as i32,
            ]
        })
        .collect();

    let mut grouped = Vec::new();
    for i in 0..clusters {
        let n1 = counts[i];
        if n1 <= min_neighbors {
            continue;
        }
        let [x1, y1, w1, h1] = averaged[i];

        let enclosed = (0..clusters).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= min_neighbors {
                return false;
            }
            let [x2, y2, w2, h2] = averaged[j];
            let dx = round(w2 as f64 * eps) as i32;
            let dy = round(h2 as f64 * eps) as i32;
            x1 >= x2 - dx
                && y1 >= y2 - dy
                && x1 + w1 <= x2 + w2 + dx
                && y1 + h1 <= y2 + h2 + dy
                && (n2 > n1.max(3) || n1 < 3)
        });

        if !enclosed && w1 > 0 && h1 > 0 {
            grouped.push(Rect::at(x1, y1).of_size(w1 as u32, h1 as u32));
        }
    }

    grouped
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.width().min(b.width()) + a.height().min(b.height())) as f64 * 0.5;
    let close = |p: i32, q: i32| ((p - q).abs() as f64) <= delta;
    close(a.left(), b.left())
        && close(a.top(), b.top())
        && close(a.right(), b.right())
        && close(a.bottom(), b.bottom())
}

/// Equivalence classes under `similar`, labelled in order of first appearance
fn partition(rects: &[Rect], eps: f64) -> Vec<usize> {
    let mut parent: Vec<usize> = (0..rects.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..rects.len() {
        for j in (i + 1)..rects.len() {
            if similar(&rects[i], &rects[j], eps) {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut root_label = vec![usize::MAX; rects.len()];
    let mut next = 0;
    (0..rects.len())
        .map(|i| {
            let root = find(&mut parent, i);
            if root_label[root] == usize::MAX {
                root_label[root] = next;
                next += 1;
            }
            root_label[root]
        })
        .collect()
}

/// Round half to even, matching the detector's reference arithmetic
fn round(value: f64) -> i64 {
    value.round_ties_even() as i64
}
