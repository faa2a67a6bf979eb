//! plate-reader - licence plate recognition
//!
//! Locates a plate in a vehicle photograph with a Haar cascade, isolates the
//! character glyphs, classifies each one with an ONNX raster classifier and
//! returns a format-validated plate string together with an annotated image.
//!
//! ```no_run
//! use plate_reader::{config::AppConfig, PlateRecognizer};
//!
//! # fn main() -> anyhow::Result<()> {
//! let recognizer = PlateRecognizer::from_config(&AppConfig::default())?;
//! let result = recognizer.recognize_bytes(&std::fs::read("car.jpg")?)?;
//! println!("{} (recognized: {})", result.plate_text(), result.recognized());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod plate;
pub mod service;
pub mod vision;

pub use error::{CascadeError, ClassifierError, RecognitionError, ServiceError};
pub use pipeline::{Outcome, PlateRecognizer, RecognitionResult};
pub use plate::{is_valid, CorrectionTables, NOT_RECOGNIZED};
pub use service::RecognitionService;
pub use vision::DetectionRegion;
