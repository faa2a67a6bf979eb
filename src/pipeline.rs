//! Plate recognition pipeline
//!
//! [`PlateRecognizer`] holds everything a recognition run needs (detector,
//! classifier, annotation resources, configuration). It is built once and
//! shared read-only; each call is independent.

use anyhow::{Context, Result};
use image::RgbImage;
use std::io::Cursor;
use std::time::Instant;
use tracing::{debug, info};

use crate::config::{AppConfig, OutputFormat};
use crate::error::RecognitionError;
use crate::plate::{assemble, is_valid, NOT_RECOGNIZED};
use crate::vision::{
    decode_image, normalize, segment, select_region, CascadePlateDetector, DetectionRegion,
    GlyphClassifier, OnnxGlyphClassifier, PlateDetector, ResultComposer,
};

/// Terminal state of a recognition run
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Plate text matches the national format
    Recognized,
    /// Detector proposed no region
    NoRegion,
    /// Region found but no glyph survived segmentation
    NoGlyphs,
    /// Glyphs classified but the text fails the format grammar
    InvalidFormat,
}

impl Outcome {
    pub fn is_recognized(self) -> bool {
        self == Outcome::Recognized
    }
}

/// Result of one recognition run
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    plate_text: String,
    raw_text: String,
    outcome: Outcome,
    region: Option<DetectionRegion>,
    annotated: RgbImage,
}

impl RecognitionResult {
    /// Corrected plate text, or `NOT RECOGNIZED` when no region was found
    pub fn plate_text(&self) -> &str {
        &self.plate_text
    }

    /// Classifier output before correction
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn recognized(&self) -> bool {
        self.outcome.is_recognized()
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Region the glyphs were read from
    pub fn region(&self) -> Option<DetectionRegion> {
        self.region
    }

    pub fn annotated_image(&self) -> &RgbImage {
        &self.annotated
    }

    /// Encode the annotated image
    pub fn encode_annotated(&self, format: OutputFormat) -> Result<Vec<u8>, RecognitionError> {
        let mut bytes = Vec::new();
        self.annotated
            .write_to(&mut Cursor::new(&mut bytes), format.image_format())
            .map_err(RecognitionError::Encode)?;
        Ok(bytes)
    }
}

/// Immutable recognition context
pub struct PlateRecognizer {
    config: AppConfig,
    detector: Box<dyn PlateDetector>,
    classifier: Box<dyn GlyphClassifier>,
    composer: ResultComposer,
}

impl PlateRecognizer {
    /// Assemble a recognizer from arbitrary stage implementations
    pub fn new(
        config: AppConfig,
        detector: impl PlateDetector + 'static,
        classifier: impl GlyphClassifier + 'static,
    ) -> Self {
        let composer = ResultComposer::from_config(&config.output);
        Self {
            config,
            detector: Box::new(detector),
            classifier: Box::new(classifier),
            composer,
        }
    }

    /// Replace the annotation renderer
    pub fn with_composer(mut self, composer: ResultComposer) -> Self {
        self.composer = composer;
        self
    }

    /// Load the cascade and classifier named in the configuration
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        config.validate()?;

        let start = Instant::now();
        let detector = CascadePlateDetector::from_config(&config.detector)
            .context("Failed to load plate detector")?;
        let classifier = OnnxGlyphClassifier::from_config(&config.classifier)
            .context("Failed to load glyph classifier")?;
        info!("Recognition context ready in {:?}", start.elapsed());

        Ok(Self::new(config.clone(), detector, classifier))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Decode raw image bytes and recognize the plate on them
    pub fn recognize_bytes(&self, bytes: &[u8]) -> Result<RecognitionResult, RecognitionError> {
        let image = decode_image(bytes)?;
        self.recognize(&image)
    }

    /// Run every stage on a decoded photograph
    pub fn recognize(&self, image: &RgbImage) -> Result<RecognitionResult, RecognitionError> {
        let start = Instant::now();

        let regions = self.detector.detect(image);
        let Some(region) = select_region(&regions, self.config.detector.selection) else {
            debug!("No plate region among {} candidates", regions.len());
            return Ok(RecognitionResult {
                plate_text: NOT_RECOGNIZED.to_string(),
                raw_text: String::new(),
                outcome: Outcome::NoRegion,
                region: None,
                annotated: self.composer.compose(image, None, NOT_RECOGNIZED, false),
            });
        };
        debug!(
            "Selected region {:?} of {} candidates",
            region,
            regions.len()
        );

        let glyphs = normalize(image, region, &self.config.normalization)
            .map(|plate| segment(&plate, &self.config.segmentation))
            .unwrap_or_default();

        if glyphs.is_empty() {
            debug!("No glyphs in region {:?}", region);
            return Ok(RecognitionResult {
                plate_text: String::new(),
                raw_text: String::new(),
                outcome: Outcome::NoGlyphs,
                region: Some(region),
                annotated: self.composer.compose(image, Some(region), "", false),
            });
        }

        let symbols = glyphs
            .iter()
            .map(|glyph| self.classifier.classify(glyph))
            .collect::<Result<Vec<char>, _>>()?;

        let raw_text = assemble(&symbols);
        let plate_text = self.config.correction.correct(&raw_text);
        let outcome = if is_valid(&plate_text) {
            Outcome::Recognized
        } else {
            Outcome::InvalidFormat
        };

        if raw_text != plate_text {
            debug!("Corrected {:?} -> {:?}", raw_text, plate_text);
        }
        info!(
            "Plate {:?} ({:?}) in {:?}",
            plate_text,
            outcome,
            start.elapsed()
        );

        let recognized = outcome.is_recognized();
        let annotated = self
            .composer
            .compose(image, Some(region), &plate_text, recognized);
        Ok(RecognitionResult {
            plate_text,
            raw_text,
            outcome,
            region: Some(region),
            annotated,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ClassifierError;
    use crate::vision::GlyphCandidate;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Detector that always proposes the same regions
    pub(crate) struct FixedDetector(pub Vec<DetectionRegion>);

    impl PlateDetector for FixedDetector {
        fn detect(&self, _image: &RgbImage) -> Vec<DetectionRegion> {
            self.0.clone()
        }
    }

    /// Classifier that replays a script, one symbol per call, wrapping around
    pub(crate) struct ScriptedClassifier {
        script: Vec<char>,
        calls: AtomicUsize,
    }

    impl ScriptedClassifier {
        pub(crate) fn new(script: &str) -> Self {
            Self {
                script: script.chars().collect(),
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl GlyphClassifier for ScriptedClassifier {
        fn classify(&self, _glyph: &GlyphCandidate) -> Result<char, ClassifierError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.script[n % self.script.len()])
        }
    }

    struct FailingClassifier;

    impl GlyphClassifier for FailingClassifier {
        fn classify(&self, _glyph: &GlyphCandidate) -> Result<char, ClassifierError> {
            Err(ClassifierError::MissingOutput)
        }
    }

    pub(crate) const PLATE_REGION: DetectionRegion = DetectionRegion {
        x: 50,
        y: 50,
        width: 333,
        height: 75,
    };

    /// Street scene with a white plate holding `glyphs` dark character boxes
    pub(crate) fn synthetic_photo(glyphs: u32) -> RgbImage {
        let mut image = RgbImage::from_pixel(500, 300, Rgb([90, 110, 130]));
        for y in 0..PLATE_REGION.height {
            for x in 0..PLATE_REGION.width {
                image.put_pixel(PLATE_REGION.x + x, PLATE_REGION.y + y, Rgb([245, 245, 245]));
            }
        }
        for i in 0..glyphs {
            let left = PLATE_REGION.x + 20 + i * 38;
            for y in 12..62 {
                for x in left..left + 20 {
                    image.put_pixel(x, PLATE_REGION.y + y, Rgb([15, 15, 15]));
                }
            }
        }
        image
    }

    fn recognizer(
        detector: FixedDetector,
        classifier: impl GlyphClassifier + 'static,
    ) -> PlateRecognizer {
        PlateRecognizer::new(AppConfig::default(), detector, classifier)
            .with_composer(ResultComposer::new(None, 48.0))
    }

    #[test]
    fn test_clean_plate_is_recognized() {
        let recognizer = recognizer(
            FixedDetector(vec![PLATE_REGION]),
            ScriptedClassifier::new("AE1455KH"),
        );
        let result = recognizer.recognize(&synthetic_photo(8)).unwrap();

        assert!(result.recognized());
        assert_eq!(result.outcome(), Outcome::Recognized);
        assert_eq!(result.plate_text(), "AE1455KH");
        assert_eq!(result.raw_text(), "AE1455KH");
        assert_eq!(result.region(), Some(PLATE_REGION));
    }

    #[test]
    fn test_no_region_reports_not_recognized() {
        let classifier = std::sync::Arc::new(ScriptedClassifier::new("AE1455KH"));
        let recognizer = recognizer(FixedDetector(vec![]), classifier.clone());
        let photo = synthetic_photo(8);
        let result = recognizer.recognize(&photo).unwrap();

        assert!(!result.recognized());
        assert_eq!(result.outcome(), Outcome::NoRegion);
        assert_eq!(result.plate_text(), NOT_RECOGNIZED);
        assert_eq!(result.region(), None);
        assert_eq!(result.annotated_image(), &photo);
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn test_confusable_glyphs_are_corrected() {
        let recognizer = recognizer(
            FixedDetector(vec![PLATE_REGION]),
            ScriptedClassifier::new("0E14S5KH"),
        );
        let result = recognizer.recognize(&synthetic_photo(8)).unwrap();

        assert_eq!(result.raw_text(), "0E14S5KH");
        assert_eq!(result.plate_text(), "OE1495KH");
        assert!(result.recognized());
    }

    #[test]
    fn test_invalid_format_is_not_recognized() {
        let recognizer = recognizer(
            FixedDetector(vec![PLATE_REGION]),
            ScriptedClassifier::new("2E1455KH"),
        );
        let result = recognizer.recognize(&synthetic_photo(8)).unwrap();

        assert_eq!(result.plate_text(), "2E1455KH");
        assert_eq!(result.outcome(), Outcome::InvalidFormat);
        assert!(!result.recognized());
        assert_ne!(result.annotated_image(), &synthetic_photo(8));
    }

    #[test]
    fn test_short_plate_skips_correction() {
        let recognizer = recognizer(
            FixedDetector(vec![PLATE_REGION]),
            ScriptedClassifier::new("0E14S5K"),
        );
        let result = recognizer.recognize(&synthetic_photo(7)).unwrap();

        assert_eq!(result.plate_text(), "0E14S5K");
        assert_eq!(result.outcome(), Outcome::InvalidFormat);
    }

    #[test]
    fn test_blank_region_has_no_glyphs() {
        let classifier = std::sync::Arc::new(ScriptedClassifier::new("AE1455KH"));
        let recognizer = recognizer(FixedDetector(vec![PLATE_REGION]), classifier.clone());
        let result = recognizer.recognize(&synthetic_photo(0)).unwrap();

        assert_eq!(result.outcome(), Outcome::NoGlyphs);
        assert_eq!(result.plate_text(), "");
        assert!(!result.recognized());
        assert_eq!(classifier.calls(), 0);
    }

    #[test]
    fn test_last_region_is_used_by_default() {
        let decoy = DetectionRegion::new(0, 200, 100, 40);
        let recognizer = recognizer(
            FixedDetector(vec![decoy, PLATE_REGION]),
            ScriptedClassifier::new("AE1455KH"),
        );
        let result = recognizer.recognize(&synthetic_photo(8)).unwrap();
        assert_eq!(result.region(), Some(PLATE_REGION));
    }

    #[test]
    fn test_classifier_failure_is_an_error() {
        let recognizer = recognizer(FixedDetector(vec![PLATE_REGION]), FailingClassifier);
        let result = recognizer.recognize(&synthetic_photo(8));
        assert!(matches!(result, Err(RecognitionError::Classifier(_))));
    }

    #[test]
    fn test_undecodable_bytes() {
        let recognizer = recognizer(FixedDetector(vec![]), ScriptedClassifier::new("A"));
        let result = recognizer.recognize_bytes(b"GIF89a but not really");
        assert!(matches!(result, Err(RecognitionError::Decode(_))));
    }

    #[test]
    fn test_recognition_is_deterministic() {
        let photo = synthetic_photo(8);
        let first = recognizer(
            FixedDetector(vec![PLATE_REGION]),
            ScriptedClassifier::new("AE1455KH"),
        )
        .recognize(&photo)
        .unwrap();
        let second = recognizer(
            FixedDetector(vec![PLATE_REGION]),
            ScriptedClassifier::new("AE1455KH"),
        )
        .recognize(&photo)
        .unwrap();

        assert_eq!(first.plate_text(), second.plate_text());
        assert_eq!(first.annotated_image(), second.annotated_image());
    }

    #[test]
    fn test_encode_annotated_png() {
        let recognizer = recognizer(
            FixedDetector(vec![PLATE_REGION]),
            ScriptedClassifier::new("AE1455KH"),
        );
        let result = recognizer.recognize(&synthetic_photo(8)).unwrap();

        let bytes = result.encode_annotated(OutputFormat::Png).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(&decoded, result.annotated_image());

        let jpeg = result.encode_annotated(OutputFormat::Jpeg).unwrap();
        assert!(jpeg.starts_with(&[0xFF, 0xD8]));
    }

    #[test]
    fn test_from_config_reports_missing_cascade() {
        let mut config = AppConfig::default();
        config.detector.cascade_path = "/nonexistent/cascade.json".into();
        assert!(PlateRecognizer::from_config(&config).is_err());
    }
}
