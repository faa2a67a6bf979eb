//! Recognition Configuration
//!
//! Tunable constants of the pipeline stored in TOML format. Every section
//! defaults to the calibrated values for the national plate format, so an
//! empty file is a valid configuration.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::plate::CorrectionTables;
use crate::vision::detection::SelectionPolicy;
use crate::vision::models::Alphabet;

/// Pipeline settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Plate region detection
    pub detector: DetectorConfig,
    /// Plate raster normalization
    pub normalization: NormalizationConfig,
    /// Glyph extraction
    pub segmentation: SegmentationConfig,
    /// Glyph classification
    pub classifier: ClassifierConfig,
    /// Position-dependent confusion correction
    pub correction: CorrectionTables,
    /// Annotated image output
    pub output: OutputConfig,
}

impl AppConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.detector.validate().context("invalid [detector] section")?;
        self.normalization
            .validate()
            .context("invalid [normalization] section")?;
        self.segmentation
            .validate()
            .context("invalid [segmentation] section")?;
        self.classifier
            .validate()
            .context("invalid [classifier] section")?;
        self.correction
            .validate()
            .context("invalid [correction] section")?;
        Ok(())
    }
}

/// Cascade detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Cascade description (JSON)
    pub cascade_path: PathBuf,
    /// Ratio between two consecutive scan scales
    pub scale_factor: f64,
    /// Raw hits a grouped region needs to be reported
    pub min_neighbors: u32,
    /// Relative tolerance used when grouping overlapping hits
    pub group_eps: f64,
    /// Which region to keep when several are proposed
    pub selection: SelectionPolicy,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            cascade_path: PathBuf::from("models/haarcascade_ua_license_plate.xml"),
            scale_factor: 1.4,
            min_neighbors: 7,
            group_eps: 0.2,
            selection: SelectionPolicy::Last,
        }
    }
}

impl DetectorConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.scale_factor > 1.0,
            "scale_factor must be greater than 1.0 (got {})",
            self.scale_factor
        );
        ensure!(
            self.group_eps >= 0.0,
            "group_eps must not be negative (got {})",
            self.group_eps
        );
        Ok(())
    }
}

/// Canonical plate raster settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    /// Canonical raster width in pixels
    pub width: u32,
    /// Canonical raster height in pixels
    pub height: u32,
    /// Border forced to background on every side
    pub border: u32,
}

impl Default for NormalizationConfig {
    fn default() -> Self {
        Self {
            width: 333,
            height: 75,
            border: 3,
        }
    }
}

impl NormalizationConfig {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.width > 2 * self.border && self.height > 2 * self.border,
            "border {} leaves no interior in a {}x{} raster",
            self.border,
            self.width,
            self.height
        );
        Ok(())
    }
}

/// Glyph extraction settings
///
/// Width bounds are fractions of the plate raster's row count and height
/// bounds are fractions of its column count. The fractions were tuned
/// against that wiring; changing it changes which contours survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Largest contours considered, by enclosed area
    pub max_contours: usize,
    /// Exclusive (lower, upper) glyph width bounds, fractions of the row count
    pub width_bounds: (f32, f32),
    /// Exclusive (lower, upper) glyph height bounds, fractions of the column count
    pub height_bounds: (f32, f32),
    /// Glyph width after resizing
    pub glyph_width: u32,
    /// Glyph height after resizing
    pub glyph_height: u32,
    /// Background margin around the glyph in its canvas
    pub canvas_border: u32,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            max_contours: 15,
            width_bounds: (1.0 / 6.0, 1.0 / 2.0),
            height_bounds: (1.0 / 10.0, 2.0 / 3.0),
            glyph_width: 20,
            glyph_height: 40,
            canvas_border: 2,
        }
    }
}

impl SegmentationConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.max_contours > 0, "max_contours must be positive");
        for (name, (lo, hi)) in [
            ("width_bounds", self.width_bounds),
            ("height_bounds", self.height_bounds),
        ] {
            ensure!(
                (0.0..hi).contains(&lo),
                "{} must satisfy 0 <= lower < upper (got {}, {})",
                name,
                lo,
                hi
            );
        }
        ensure!(
            self.glyph_width > 0 && self.glyph_height > 0,
            "glyph size must be non-zero"
        );
        Ok(())
    }

    /// Canvas width including the margin on both sides
    pub fn canvas_width(&self) -> u32 {
        self.glyph_width + 2 * self.canvas_border
    }

    /// Canvas height including the margin on both sides
    pub fn canvas_height(&self) -> u32 {
        self.glyph_height + 2 * self.canvas_border
    }
}

/// Glyph classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// ONNX model file
    pub model_path: PathBuf,
    /// Expected SHA-256 of the model file (hex), checked at load when set
    pub model_sha256: Option<String>,
    /// Square input side expected by the model
    pub input_size: u32,
    /// Multiplier applied to 0-255 pixel values before inference
    pub pixel_scale: f32,
    /// Class id to symbol mapping
    pub alphabet: Alphabet,
    /// Intra-operation threads for ONNX Runtime
    pub intra_threads: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("models/model_ua_license_plate.onnx"),
            model_sha256: None,
            input_size: 28,
            pixel_scale: 1.0,
            alphabet: Alphabet::default(),
            intra_threads: 4,
        }
    }
}

impl ClassifierConfig {
    fn validate(&self) -> Result<()> {
        ensure!(self.input_size > 0, "input_size must be positive");
        ensure!(
            self.pixel_scale.is_finite() && self.pixel_scale > 0.0,
            "pixel_scale must be a positive number"
        );
        ensure!(self.intra_threads > 0, "intra_threads must be positive");
        Ok(())
    }
}

/// Encoding of the annotated image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
}

impl OutputFormat {
    pub fn image_format(self) -> image::ImageFormat {
        match self {
            OutputFormat::Png => image::ImageFormat::Png,
            OutputFormat::Jpeg => image::ImageFormat::Jpeg,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }
}

/// Annotated image settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Encoding of the annotated image
    pub format: OutputFormat,
    /// TrueType font for the plate text; system fonts are tried when unset
    pub font_path: Option<PathBuf>,
    /// Text height in pixels
    pub font_scale: f32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            font_path: None,
            font_scale: 48.0,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    config.validate()?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let proj_dirs = directories::ProjectDirs::from("com", "platereader", "PlateReader")
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

    Ok(proj_dirs.config_dir().to_path_buf())
}

/// Default location of `config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_app_config() {
        let config = AppConfig::default();

        assert!((config.detector.scale_factor - 1.4).abs() < 1e-9);
        assert_eq!(config.detector.min_neighbors, 7);
        assert_eq!(config.detector.selection, SelectionPolicy::Last);

        assert_eq!(config.normalization.width, 333);
        assert_eq!(config.normalization.height, 75);
        assert_eq!(config.normalization.border, 3);

        assert_eq!(config.segmentation.max_contours, 15);
        assert_eq!(config.segmentation.canvas_width(), 24);
        assert_eq!(config.segmentation.canvas_height(), 44);

        assert_eq!(config.classifier.input_size, 28);
        assert_eq!(config.output.format, OutputFormat::Png);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let config = AppConfig::default();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.detector.min_neighbors, parsed.detector.min_neighbors);
        assert_eq!(config.segmentation.width_bounds, parsed.segmentation.width_bounds);
        assert_eq!(config.classifier.alphabet, parsed.classifier.alphabet);
        assert_eq!(config.correction, parsed.correction);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [detector]
            min_neighbors = 3

            [output]
            format = "jpeg"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.detector.min_neighbors, 3);
        assert!((parsed.detector.scale_factor - 1.4).abs() < 1e-9);
        assert_eq!(parsed.output.format, OutputFormat::Jpeg);
        assert_eq!(parsed.normalization.width, 333);
    }

    #[test]
    fn test_save_and_load_config() {
        let mut config = AppConfig::default();
        config.detector.min_neighbors = 5;

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(loaded.detector.min_neighbors, 5);
        assert_eq!(loaded.normalization.width, config.normalization.width);
        assert_eq!(loaded.correction, config.correction);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/path/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_rejects_bad_scale_factor() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[detector]\nscale_factor = 1.0").unwrap();

        let result = load_config(temp_file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut config = AppConfig::default();
        config.segmentation.height_bounds = (0.7, 0.1);
        assert!(config.validate().is_err());
    }
}
