//! Glyph classifier backed by ONNX Runtime
//!
//! Handles model integrity checks, session loading and the mapping from
//! classifier output to plate symbols.

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::segmentation::GlyphCandidate;
use crate::config::ClassifierConfig;
use crate::error::ClassifierError;

/// Number of symbol classes
pub const ALPHABET_LEN: usize = 36;

const DEFAULT_ALPHABET: &str = "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Class id to symbol mapping, in the order the classifier was trained on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Alphabet([char; ALPHABET_LEN]);

impl Alphabet {
    /// Symbol for a class id, `None` when out of range
    pub fn symbol(&self, class_id: usize) -> Option<char> {
        self.0.get(class_id).copied()
    }
}

impl Default for Alphabet {
    fn default() -> Self {
        let mut symbols = ['0'; ALPHABET_LEN];
        for (slot, c) in symbols.iter_mut().zip(DEFAULT_ALPHABET.chars()) {
            *slot = c;
        }
        Self(symbols)
    }
}

impl TryFrom<String> for Alphabet {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let chars: Vec<char> = value.chars().collect();
        let symbols: [char; ALPHABET_LEN] = chars.as_slice().try_into().map_err(|_| {
            format!(
                "alphabet must have {} symbols, got {}",
                ALPHABET_LEN,
                chars.len()
            )
        })?;

        let mut seen = symbols.to_vec();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != ALPHABET_LEN {
            return Err("alphabet symbols must be distinct".to_string());
        }

        Ok(Self(symbols))
    }
}

impl From<Alphabet> for String {
    fn from(alphabet: Alphabet) -> Self {
        alphabet.0.iter().collect()
    }
}

impl fmt::Display for Alphabet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0 {
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// Stage that maps one glyph raster to one symbol
pub trait GlyphClassifier: Send + Sync {
    fn classify(&self, glyph: &GlyphCandidate) -> Result<char, ClassifierError>;
}

impl<T: GlyphClassifier + ?Sized> GlyphClassifier for Arc<T> {
    fn classify(&self, glyph: &GlyphCandidate) -> Result<char, ClassifierError> {
        (**self).classify(glyph)
    }
}

/// Check a file against an expected hex SHA-256 digest
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let hash = format!("{:x}", hasher.finalize());

    if !hash.eq_ignore_ascii_case(expected.trim()) {
        bail!(
            "Checksum mismatch for {:?}: expected {}, got {}",
            path,
            expected,
            hash
        );
    }
    info!("Checksum verified for {:?}", path);
    Ok(())
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file
    pub fn new(model_path: &Path, intra_threads: usize) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)
            .context("Failed to load ONNX model")?;

        let input_names: Vec<String> = session
            .inputs
            .iter()
            .map(|input| input.name.clone())
            .collect();

        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        info!(
            "Model loaded. Inputs: {:?}, Outputs: {:?}",
            input_names, output_names
        );

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

/// Glyph classifier running a raster CNN through ONNX Runtime
///
/// The session needs exclusive access while running, so calls from several
/// threads are serialized.
pub struct OnnxGlyphClassifier {
    session: Mutex<OnnxSession>,
    output_name: String,
    input_size: u32,
    pixel_scale: f32,
    alphabet: Alphabet,
}

impl OnnxGlyphClassifier {
    /// Verify (when a digest is configured) and load the model
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        if let Some(expected) = &config.model_sha256 {
            verify_sha256(&config.model_path, expected)?;
        }

        let session = OnnxSession::new(&config.model_path, config.intra_threads)?;
        if session.input_names().len() != 1 {
            bail!(
                "Glyph model must take exactly one input, found {:?}",
                session.input_names()
            );
        }
        let output_name = session
            .output_names()
            .first()
            .cloned()
            .context("Glyph model has no outputs")?;

        Ok(Self {
            session: Mutex::new(session),
            output_name,
            input_size: config.input_size,
            pixel_scale: config.pixel_scale,
            alphabet: config.alphabet,
        })
    }
}

impl GlyphClassifier for OnnxGlyphClassifier {
    fn classify(&self, glyph: &GlyphCandidate) -> Result<char, ClassifierError> {
        let input = glyph_tensor(&glyph.raster, self.input_size, self.pixel_scale);
        let tensor = Value::from_array(input)?;

        let mut onnx = self.session.lock();
        let outputs = onnx.session_mut().run(ort::inputs![tensor])?;
        let output = outputs
            .get(self.output_name.as_str())
            .ok_or(ClassifierError::MissingOutput)?;
        let (_, scores) = output.try_extract_tensor::<f32>()?;

        let size_error = ClassifierError::OutputSize {
            expected: ALPHABET_LEN,
            actual: scores.len(),
        };
        if scores.len() != ALPHABET_LEN {
            return Err(size_error);
        }
        let Some(symbol) = argmax(scores).and_then(|id| self.alphabet.symbol(id)) else {
            return Err(size_error);
        };

        debug!("Glyph at x={} -> {:?}", glyph.x_position, symbol);
        Ok(symbol)
    }
}

/// Resize a glyph canvas and lay it out as a `(1, size, size, 3)` NHWC tensor
///
/// The single channel is replicated three times and scaled by `pixel_scale`.
pub fn glyph_tensor(canvas: &GrayImage, size: u32, pixel_scale: f32) -> Array4<f32> {
    let resized = imageops::resize(canvas, size, size, FilterType::Triangle);
    let side = size as usize;

    Array4::from_shape_fn((1, side, side, 3), |(_, y, x, _)| {
        resized.get_pixel(x as u32, y as u32)[0] as f32 * pixel_scale
    })
}

/// Index of the highest score; the first one wins ties and NaN never wins
pub fn argmax(scores: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_alphabet() {
        let alphabet = Alphabet::default();
        assert_eq!(alphabet.symbol(0), Some('0'));
        assert_eq!(alphabet.symbol(9), Some('9'));
        assert_eq!(alphabet.symbol(10), Some('A'));
        assert_eq!(alphabet.symbol(35), Some('Z'));
        assert_eq!(alphabet.symbol(36), None);
        assert_eq!(alphabet.to_string(), DEFAULT_ALPHABET);
    }

    #[test]
    fn test_alphabet_from_string() {
        let reversed: String = DEFAULT_ALPHABET.chars().rev().collect();
        let alphabet = Alphabet::try_from(reversed).unwrap();
        assert_eq!(alphabet.symbol(0), Some('Z'));

        assert!(Alphabet::try_from("ABC".to_string()).is_err());
        let duplicated = format!("{}A", &DEFAULT_ALPHABET[..35]);
        assert!(Alphabet::try_from(duplicated).is_err());
    }

    #[test]
    fn test_alphabet_serde_as_string() {
        let json = serde_json::to_string(&Alphabet::default()).unwrap();
        assert_eq!(json, format!("\"{}\"", DEFAULT_ALPHABET));

        let parsed: Alphabet = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Alphabet::default());
        assert!(serde_json::from_str::<Alphabet>("\"0123\"").is_err());
    }

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[0.1, 0.7, 0.2]), Some(1));
        assert_eq!(argmax(&[0.5, 0.5, 0.1]), Some(0));
        assert_eq!(argmax(&[f32::NAN, 0.2, 0.1]), Some(1));
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_glyph_tensor_layout() {
        let mut canvas = GrayImage::from_pixel(24, 44, Luma([0]));
        for y in 2..42 {
            for x in 2..22 {
                canvas.put_pixel(x, y, Luma([255]));
            }
        }

        let tensor = glyph_tensor(&canvas, 28, 1.0);
        assert_eq!(tensor.shape(), &[1, 28, 28, 3]);

        // Raw 0-255 values, identical across channels
        assert_eq!(tensor[[0, 14, 14, 0]], 255.0);
        assert_eq!(tensor[[0, 14, 14, 1]], tensor[[0, 14, 14, 2]]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_glyph_tensor_pixel_scale() {
        let canvas = GrayImage::from_pixel(24, 44, Luma([255]));
        let tensor = glyph_tensor(&canvas, 28, 1.0 / 255.0);
        assert!((tensor[[0, 5, 5, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_verify_sha256() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();

        let digest = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_sha256(file.path(), digest).is_ok());
        assert!(verify_sha256(file.path(), &digest.to_uppercase()).is_ok());
        assert!(verify_sha256(file.path(), &"0".repeat(64)).is_err());
    }

    #[test]
    fn test_classifier_checksum_mismatch_fails_before_loading() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a model").unwrap();

        let config = ClassifierConfig {
            model_path: file.path().to_path_buf(),
            model_sha256: Some("0".repeat(64)),
            ..ClassifierConfig::default()
        };
        let err = OnnxGlyphClassifier::from_config(&config).err().unwrap();
        assert!(err.to_string().contains("Checksum mismatch"));
    }
}
