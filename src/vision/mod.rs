//! Vision/OCR Layer
//!
//! Reads text out of uploaded images. The pipeline runs PaddleOCR models
//! through ONNX Runtime: a DBNet detector finds text quadrilaterals and a
//! CRNN recognizer reads each one.

pub mod models;
pub mod ocr;
pub mod postprocess;
pub mod preprocess;

use anyhow::{bail, Result};
use ndarray::ArrayView3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::render::Point;

pub use models::{ModelManager, ModelType};
pub use ocr::{Device, OcrEngine};
pub use postprocess::DbParams;
pub use preprocess::PreprocessConfig;

/// Languages the bundled recognition model can read
pub const SUPPORTED_LANGUAGES: &[&str] = &["en"];

/// One detected text region
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Region outline, usually a quadrilateral clockwise from top-left
    pub polygon: Vec<Point>,
    /// Recognized text
    pub text: String,
    /// Recognition confidence (0.0 - 1.0)
    pub confidence: f32,
}

/// Hardware a recognition call actually ran on
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Acceleration {
    /// CPU, as requested
    #[default]
    Cpu,
    /// GPU through the named execution provider
    Gpu { provider: String },
    /// GPU was requested but none was usable
    CpuFallback,
}

impl fmt::Display for Acceleration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acceleration::Cpu => write!(f, "CPU"),
            Acceleration::Gpu { provider } => write!(f, "GPU ({provider})"),
            Acceleration::CpuFallback => write!(f, "CPU (GPU unavailable)"),
        }
    }
}

/// Options for one recognition call
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOptions {
    /// Languages to read, e.g. `["en"]`
    pub languages: Vec<String>,
    /// Ask for GPU acceleration; a hint, not a guarantee
    pub prefer_gpu: bool,
}

/// Output of one recognition call
#[derive(Debug, Clone, Default)]
pub struct Recognition {
    /// Regions in reading order
    pub detections: Vec<Detection>,
    pub acceleration: Acceleration,
}

/// Combined text detection and recognition
pub trait Recognizer: Send {
    /// Find and read every text region in an `(H, W, C)` pixel array
    fn read_text(&mut self, image: ArrayView3<u8>, options: &ReadOptions) -> Result<Recognition>;
}

/// Configuration for the vision pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Default recognition languages
    pub languages: Vec<String>,
    /// Whether to use GPU acceleration when a request asks for it
    pub use_gpu: bool,
    /// Model cache directory (defaults to the application data directory)
    pub models_dir: Option<PathBuf>,
    /// Longest side of the detection input (larger images are scaled down)
    pub max_side_len: u32,
    /// Minimum confidence threshold for text recognition (0.0 - 1.0)
    pub recognition_threshold: f32,
    /// Detection post-processing
    pub detection: DbParams,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            languages: vec!["en".to_string()],
            use_gpu: true,
            models_dir: None,
            max_side_len: 960,
            recognition_threshold: 0.0,
            detection: DbParams::default(),
        }
    }
}

/// Check a language list against what the recognition model supports
pub fn validate_languages(languages: &[String]) -> Result<()> {
    if languages.is_empty() {
        bail!("No recognition language requested");
    }
    for language in languages {
        if !SUPPORTED_LANGUAGES.contains(&language.as_str()) {
            bail!(
                "Unsupported recognition language '{}' (supported: {})",
                language,
                SUPPORTED_LANGUAGES.join(", ")
            );
        }
    }
    Ok(())
}

/// Vision processing pipeline with lazily loaded CPU and GPU engines
pub struct VisionPipeline {
    /// Engine pinned to the CPU
    cpu_engine: Option<OcrEngine>,
    /// Engine that asked for a GPU
    accelerated_engine: Option<OcrEngine>,
    /// Current configuration
    config: VisionConfig,
    /// Model manager for PaddleOCR
    model_manager: ModelManager,
}

impl VisionPipeline {
    /// Create a new vision pipeline; models are loaded on first use
    pub fn new(config: VisionConfig, model_manager: ModelManager) -> Self {
        Self {
            cpu_engine: None,
            accelerated_engine: None,
            config,
            model_manager,
        }
    }

    /// Check if models are ready
    pub fn are_models_ready(&self) -> bool {
        self.model_manager.are_models_ready()
    }

    /// Get the engine for a device, loading it on first use
    fn engine(&mut self, device: Device) -> Result<&mut OcrEngine> {
        let slot = match device {
            Device::Cpu => &mut self.cpu_engine,
            Device::PreferGpu => &mut self.accelerated_engine,
        };

        if slot.is_none() {
            info!("Initializing PaddleOCR engine ({:?})", device);
            let preprocess = PreprocessConfig {
                det_limit_side_len: self.config.max_side_len,
                ..Default::default()
            };
            let engine = OcrEngine::from_manager(
                &self.model_manager,
                device,
                preprocess,
                self.config.detection.clone(),
            )?;
            info!("PaddleOCR initialized on {}", engine.acceleration());
            *slot = Some(engine);
        }

        match slot {
            Some(engine) => Ok(engine),
            None => bail!("OCR engine failed to initialize"),
        }
    }
}

impl Recognizer for VisionPipeline {
    fn read_text(&mut self, image: ArrayView3<u8>, options: &ReadOptions) -> Result<Recognition> {
        validate_languages(&options.languages)?;

        let device = if options.prefer_gpu && self.config.use_gpu {
            Device::PreferGpu
        } else {
            Device::Cpu
        };
        let threshold = self.config.recognition_threshold;

        let start = Instant::now();
        let engine = self.engine(device)?;
        let acceleration = engine.acceleration().clone();
        if device == Device::PreferGpu && acceleration == Acceleration::CpuFallback {
            warn!("GPU acceleration requested but unavailable, running on CPU");
        }

        let detections: Vec<Detection> = engine
            .recognize(image)?
            .into_iter()
            .filter(|d| d.confidence >= threshold)
            .collect();

        debug!(
            "Vision processing on {} complete in {:?}: {} text regions",
            acceleration,
            start.elapsed(),
            detections.len()
        );

        Ok(Recognition {
            detections,
            acceleration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::TempDir;

    #[test]
    fn test_validate_languages() {
        assert!(validate_languages(&["en".to_string()]).is_ok());
        assert!(validate_languages(&[]).is_err());

        let err = validate_languages(&["en".to_string(), "xx".to_string()]).unwrap_err();
        assert!(err.to_string().contains("'xx'"));
    }

    #[test]
    fn test_default_vision_config() {
        let config = VisionConfig::default();
        assert_eq!(config.languages, vec!["en"]);
        assert!(config.use_gpu);
        assert!(config.models_dir.is_none());
        assert_eq!(config.recognition_threshold, 0.0);
    }

    #[test]
    fn test_acceleration_display() {
        assert_eq!(Acceleration::Cpu.to_string(), "CPU");
        assert_eq!(
            Acceleration::Gpu { provider: "CUDA".to_string() }.to_string(),
            "GPU (CUDA)"
        );
        assert_eq!(Acceleration::CpuFallback.to_string(), "CPU (GPU unavailable)");
    }

    #[test]
    fn test_pipeline_without_models_reports_missing_files() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        let mut pipeline = VisionPipeline::new(VisionConfig::default(), manager);
        assert!(!pipeline.are_models_ready());

        let image = Array3::<u8>::from_elem((10, 10, 3), 255);
        let options = ReadOptions {
            languages: vec!["en".to_string()],
            prefer_gpu: false,
        };

        let err = pipeline.read_text(image.view(), &options).unwrap_err();
        assert!(err.to_string().contains("model missing"));
    }

    #[test]
    fn test_pipeline_rejects_unknown_language_before_loading() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        let mut pipeline = VisionPipeline::new(VisionConfig::default(), manager);

        let image = Array3::<u8>::zeros((4, 4, 3));
        let options = ReadOptions {
            languages: vec!["tlh".to_string()],
            prefer_gpu: true,
        };

        let err = pipeline.read_text(image.view(), &options).unwrap_err();
        assert!(err.to_string().contains("Unsupported recognition language"));
    }
}
