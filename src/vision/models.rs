//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of PaddleOCR models.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::execution_providers::{ExecutionProvider, ExecutionProviderDispatch};
use ort::session::{builder::GraphOptimizationLevel, Session};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::Acceleration;

/// Environment variable that forbids model downloads
pub const OFFLINE_ENV: &str = "TEXTLENS_OFFLINE";

/// Model identifier for PaddleOCR components
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (CRNN)
    Recognition,
    /// Character dictionary for recognition
    Dictionary,
}

impl ModelType {
    /// Every file the OCR pipeline needs
    pub const ALL: [ModelType; 3] = [ModelType::Detection, ModelType::Recognition, ModelType::Dictionary];

    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Detection => "det.onnx",
            ModelType::Recognition => "rec.onnx",
            ModelType::Dictionary => "dict.txt",
        }
    }

    /// Get the download URL for this model
    /// Using PaddleOCR models from Hugging Face (monkt/paddleocr-onnx)
    pub fn download_url(&self) -> &'static str {
        match self {
            ModelType::Detection => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx"
            }
            ModelType::Recognition => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx"
            }
            ModelType::Dictionary => {
                "https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt"
            }
        }
    }

    /// Expected file size for integrity check (approximate, in bytes)
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::Detection => (2_000_000, 5_000_000),    // ~2.43 MB
            ModelType::Recognition => (7_000_000, 10_000_000), // ~7.83 MB
            ModelType::Dictionary => (500, 10_000),            // ~1.42 KB
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Detection => "Text Detection",
            ModelType::Recognition => "Text Recognition",
            ModelType::Dictionary => "Character Dictionary",
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    /// Seconds since the Unix epoch
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Model manager for downloading and caching ONNX models
#[derive(Debug, Clone)]
pub struct ModelManager {
    models_dir: PathBuf,
    offline: bool,
}

impl ModelManager {
    /// Create a model manager using the application data directory
    pub fn new() -> Result<Self> {
        let data_dir = crate::storage::get_data_dir()?;
        Self::with_dir(data_dir.join("models"))
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self {
            models_dir,
            offline: std::env::var_os(OFFLINE_ENV).is_some(),
        })
    }

    /// Forbid network downloads when `offline` is set
    ///
    /// Offline mode only ever turns on: `false` keeps an earlier `true` or a
    /// set `TEXTLENS_OFFLINE`.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = self.offline || offline;
        self
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Check if a model is already downloaded
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                // Verify file size is reasonable
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    /// Check if all required models are available
    pub fn are_models_ready(&self) -> bool {
        ModelType::ALL.iter().all(|&m| self.is_model_available(m))
    }

    /// Path to a model, failing with download instructions if it is missing
    pub fn require_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);
        if !self.is_model_available(model_type) {
            anyhow::bail!(
                "{} model missing at {:?}; download it from {}",
                model_type.display_name(),
                path,
                model_type.download_url()
            );
        }
        Ok(path)
    }

    /// Download every model that is not already cached
    pub async fn ensure_all_models(&self) -> Result<()> {
        for model_type in ModelType::ALL {
            self.ensure_model(model_type).await?;
        }
        Ok(())
    }

    /// Download a model if not already available
    /// Returns the path to the model file
    pub async fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        if self.offline {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                model_type.download_url(),
                path
            );
        }

        self.download_model(model_type).await?;
        Ok(path)
    }

    /// Download a specific model
    async fn download_model(&self, model_type: ModelType) -> Result<()> {
        let url = model_type.download_url();
        let path = self.model_path(model_type);

        info!("Downloading {} model from {}", model_type.display_name(), url);

        let sha256 = download_file(url, &path).await?;

        // Verify the download
        if !self.is_model_available(model_type) {
            std::fs::remove_file(&path).ok();
            anyhow::bail!("Download of {} completed but size verification failed", url);
        }

        self.update_manifest_for_model(model_type, sha256)?;

        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    /// Update manifest after successful download
    fn update_manifest_for_model(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(model_type))?;

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: metadata.len(),
            sha256,
            downloaded_at: unix_now(),
        };

        // Update or add model info
        if let Some(existing) = manifest.models.iter_mut().find(|m| m.filename == model_info.filename) {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            let manifest: ModelManifest = serde_json::from_str(&content)?;
            Ok(manifest)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

/// Stream a URL into `path` through a temp file, returning its SHA-256
async fn download_file(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300)) // 5 minute timeout
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    debug!("Download size: {:?} bytes", response.content_length());

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
    }

    file.flush().context("Failed to flush temp file")?;
    drop(file);

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;

    Ok(format!("{:x}", hasher.finalize()))
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    acceleration: Acceleration,
}

impl OnnxSession {
    /// Create a new CPU session from a model file
    pub fn new(model_path: &Path) -> Result<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        log_io_names(&session);

        Ok(Self {
            session,
            acceleration: Acceleration::Cpu,
        })
    }

    /// Create session with GPU acceleration if available, CPU otherwise
    pub fn new_with_gpu(model_path: &Path) -> Result<Self> {
        let Some((provider, dispatch)) = gpu_provider() else {
            warn!("No GPU execution provider available, using CPU for {:?}", model_path);
            let mut session = Self::new(model_path)?;
            session.acceleration = Acceleration::CpuFallback;
            return Ok(session);
        };

        info!("Loading ONNX model with {} acceleration from {:?}", provider, model_path);

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .with_execution_providers([dispatch])?
            .commit_from_file(model_path)
            .with_context(|| format!("Failed to load ONNX model {:?}", model_path))?;

        log_io_names(&session);

        Ok(Self {
            session,
            acceleration: Acceleration::Gpu {
                provider: provider.to_string(),
            },
        })
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Hardware the session runs on
    pub fn acceleration(&self) -> &Acceleration {
        &self.acceleration
    }
}

fn log_io_names(session: &Session) {
    let inputs: Vec<&str> = session.inputs.iter().map(|i| i.name.as_str()).collect();
    let outputs: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
    info!("Model loaded. Inputs: {:?}, Outputs: {:?}", inputs, outputs);
}

/// First GPU execution provider this build of ONNX Runtime can use
fn gpu_provider() -> Option<(&'static str, ExecutionProviderDispatch)> {
    #[cfg(target_os = "macos")]
    {
        use ort::execution_providers::CoreMLExecutionProvider;
        let coreml = CoreMLExecutionProvider::default();
        if coreml.is_available().unwrap_or(false) {
            return Some(("CoreML", coreml.build()));
        }
    }

    #[cfg(not(target_os = "macos"))]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        let cuda = CUDAExecutionProvider::default();
        if cuda.is_available().unwrap_or(false) {
            return Some(("CUDA", cuda.build()));
        }
    }

    #[cfg(target_os = "windows")]
    {
        use ort::execution_providers::DirectMLExecutionProvider;
        let directml = DirectMLExecutionProvider::default();
        if directml.is_available().unwrap_or(false) {
            return Some(("DirectML", directml.build()));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_model_type_filenames() {
        assert_eq!(ModelType::Detection.filename(), "det.onnx");
        assert_eq!(ModelType::Recognition.filename(), "rec.onnx");
        assert_eq!(ModelType::Dictionary.filename(), "dict.txt");
    }

    #[test]
    fn test_model_manager_with_dir() {
        let dir = TempDir::new().unwrap();
        let models_dir = dir.path().join("models");

        let manager = ModelManager::with_dir(models_dir.clone()).unwrap();

        assert!(models_dir.is_dir());
        assert_eq!(manager.model_path(ModelType::Detection), models_dir.join("det.onnx"));
        assert!(!manager.are_models_ready());
    }

    #[test]
    fn test_undersized_model_is_not_available() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();

        std::fs::write(manager.model_path(ModelType::Dictionary), "a\n").unwrap();
        assert!(!manager.is_model_available(ModelType::Dictionary));

        std::fs::write(manager.model_path(ModelType::Dictionary), "a\n".repeat(400)).unwrap();
        assert!(manager.is_model_available(ModelType::Dictionary));
    }

    #[test]
    fn test_require_model_reports_url() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();

        let err = manager.require_model(ModelType::Recognition).unwrap_err();
        assert!(err.to_string().contains(ModelType::Recognition.download_url()));
    }

    #[tokio::test]
    async fn test_offline_mode_refuses_download() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap().offline(true);

        let err = manager.ensure_model(ModelType::Detection).await.unwrap_err();
        assert!(err.to_string().contains("Offline mode"));
    }

    #[tokio::test]
    async fn test_offline_mode_cannot_be_switched_back_off() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf())
            .unwrap()
            .offline(true)
            .offline(false);

        let err = manager.ensure_model(ModelType::Dictionary).await.unwrap_err();
        assert!(err.to_string().contains("Offline mode"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let dir = TempDir::new().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();

        assert!(manager.load_manifest().unwrap().models.is_empty());

        let mut manifest = ModelManifest::default();
        manifest.models.push(ModelInfo {
            model_type: "Detection".to_string(),
            filename: "det.onnx".to_string(),
            size_bytes: 42,
            sha256: "abc".to_string(),
            downloaded_at: 1,
        });
        manager.save_manifest(&manifest).unwrap();

        let loaded = manager.load_manifest().unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].sha256, "abc");
    }
}
