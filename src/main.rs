//! plate-reader - licence plate recognition from the command line
//!
//! Runs the recognition pipeline on image files and prints the plate text
//! together with whether it passed the national format check.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use plate_reader::config::{self, AppConfig};
use plate_reader::{
    is_valid, DetectionRegion, Outcome, PlateRecognizer, RecognitionError, RecognitionResult,
    RecognitionService, ServiceError,
};

/// plate-reader - licence plate recognition
#[derive(Parser, Debug)]
#[command(name = "plate-reader")]
#[command(about = "Recognize licence plates in vehicle photographs")]
struct Args {
    /// Configuration file (defaults to config.toml in the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recognize the plate in one image
    Recognize {
        image: PathBuf,

        /// Write the annotated image here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Recognize plates in many images concurrently
    Batch {
        #[arg(required = true)]
        images: Vec<PathBuf>,

        /// Images processed at the same time
        #[arg(short, long, default_value_t = 4)]
        jobs: usize,

        /// Per-image deadline in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Write annotated images into this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Correct and validate a plate string
    Validate { text: String },
    /// Write the default configuration as TOML
    InitConfig {
        /// Target file (defaults to the user config directory)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// One line of output
#[derive(Serialize)]
struct Report<'a> {
    image: &'a Path,
    plate_text: &'a str,
    raw_text: &'a str,
    recognized: bool,
    outcome: Outcome,
    region: Option<DetectionRegion>,
}

impl<'a> Report<'a> {
    fn new(image: &'a Path, result: &'a RecognitionResult) -> Self {
        Self {
            image,
            plate_text: result.plate_text(),
            raw_text: result.raw_text(),
            recognized: result.recognized(),
            outcome: result.outcome(),
            region: result.region(),
        }
    }

    fn print(&self, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string(self)?);
        } else {
            println!(
                "{}\t{}\t{}",
                self.image.display(),
                self.plate_text,
                self.recognized
            );
        }
        Ok(())
    }
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    match args.command {
        Command::Recognize { image, output } => {
            let config = load_app_config(args.config.as_deref())?;
            run_recognize(&config, &image, output.as_deref(), args.json)
        }
        Command::Batch {
            images,
            jobs,
            timeout_ms,
            output_dir,
        } => {
            let config = load_app_config(args.config.as_deref())?;
            let limit = timeout_ms.map(Duration::from_millis);
            run_batch(&config, images, jobs, limit, output_dir.as_deref(), args.json)
        }
        Command::Validate { text } => {
            let config = load_app_config(args.config.as_deref())?;
            let corrected = config.correction.correct(&text);
            let valid = is_valid(&corrected);
            println!("{}\t{}", corrected, valid);
            Ok(if valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::InitConfig { path, force } => {
            let path = match path.or(args.config) {
                Some(path) => path,
                None => config::default_config_path()?,
            };
            if path.exists() && !force {
                bail!("{:?} already exists (use --force to overwrite)", path);
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {:?}", parent))?;
            }
            config::save_config(&AppConfig::default(), &path)?;
            info!("Wrote default configuration to {:?}", path);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Explicit path, then the user config directory, then built-in defaults
fn load_app_config(path: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = path {
        let config = config::load_config(path)?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(default_path) = config::default_config_path() {
        if default_path.exists() {
            let config = config::load_config(&default_path)?;
            info!("Loaded configuration from {:?}", default_path);
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}

fn run_recognize(
    config: &AppConfig,
    image: &Path,
    output: Option<&Path>,
    json: bool,
) -> Result<ExitCode> {
    let recognizer = PlateRecognizer::from_config(config)?;
    let bytes = std::fs::read(image).with_context(|| format!("Failed to read {:?}", image))?;

    let result = match recognizer.recognize_bytes(&bytes) {
        Ok(result) => result,
        Err(e @ RecognitionError::Decode(_)) => {
            error!("{:?}: {}", image, e);
            return Ok(ExitCode::FAILURE);
        }
        Err(e) => return Err(e.into()),
    };

    Report::new(image, &result).print(json)?;

    if let Some(output) = output {
        let encoded = result.encode_annotated(config.output.format)?;
        std::fs::write(output, encoded).with_context(|| format!("Failed to write {:?}", output))?;
        info!("Annotated image written to {:?}", output);
    }

    Ok(ExitCode::SUCCESS)
}

fn run_batch(
    config: &AppConfig,
    images: Vec<PathBuf>,
    jobs: usize,
    limit: Option<Duration>,
    output_dir: Option<&Path>,
    json: bool,
) -> Result<ExitCode> {
    let recognizer = Arc::new(PlateRecognizer::from_config(config)?);
    let mut service = RecognitionService::new(recognizer);
    if let Some(limit) = limit {
        service = service.with_timeout(limit);
    }

    if let Some(dir) = output_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
    }

    let total = images.len();
    let mut failures = 0usize;
    let mut readable = Vec::with_capacity(images.len());
    let mut inputs = Vec::with_capacity(images.len());
    for path in images {
        match std::fs::read(&path) {
            Ok(bytes) => {
                inputs.push(bytes);
                readable.push(path);
            }
            Err(e) => {
                error!("Failed to read {:?}: {}", path, e);
                failures += 1;
            }
        }
    }

    let runtime = Runtime::new().context("Failed to start async runtime")?;
    let results = runtime.block_on(service.recognize_many(inputs, jobs));
    let names = output_names(&readable, config.output.format.extension());

    for ((path, name), result) in readable.iter().zip(&names).zip(results) {
        let result = match result {
            Ok(result) => result,
            Err(ServiceError::Timeout(limit)) => {
                warn!("{:?}: no result within {:?}", path, limit);
                failures += 1;
                continue;
            }
            Err(e @ ServiceError::Recognition(RecognitionError::Decode(_))) => {
                error!("{:?}: {}", path, e);
                failures += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        Report::new(path, &result).print(json)?;

        if let Some(dir) = output_dir {
            let target = dir.join(name);
            let encoded = result.encode_annotated(config.output.format)?;
            std::fs::write(&target, encoded)
                .with_context(|| format!("Failed to write {:?}", target))?;
        }
    }

    info!("Processed {} images, {} failed", total, failures);
    Ok(if failures == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Annotated image file names for a batch, one per input
///
/// Inputs sharing a file stem get their position appended so no output
/// overwrites another.
fn output_names(paths: &[PathBuf], extension: &str) -> Vec<String> {
    let stems: Vec<String> = paths
        .iter()
        .map(|p| {
            p.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string())
        })
        .collect();

    let mut seen = HashMap::new();
    for stem in &stems {
        *seen.entry(stem.as_str()).or_insert(0usize) += 1;
    }

    stems
        .iter()
        .enumerate()
        .map(|(index, stem)| {
            if seen[stem.as_str()] > 1 {
                format!("{}-{}.{}", stem, index, extension)
            } else {
                format!("{}.{}", stem, extension)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_names_unique_stems_unchanged() {
        let paths = vec![PathBuf::from("a/car.jpg"), PathBuf::from("b/truck.png")];
        assert_eq!(output_names(&paths, "png"), vec!["car.png", "truck.png"]);
    }

    #[test]
    fn test_output_names_disambiguate_shared_stems() {
        let paths = vec![
            PathBuf::from("day/car.jpg"),
            PathBuf::from("bus.jpg"),
            PathBuf::from("night/car.png"),
        ];
        let names = output_names(&paths, "jpg");
        assert_eq!(names, vec!["car-0.jpg", "bus.jpg", "car-2.jpg"]);
    }

    #[test]
    fn test_output_names_without_stem() {
        let paths = vec![PathBuf::from("/")];
        assert_eq!(output_names(&paths, "png"), vec!["image.png"]);
    }
}
