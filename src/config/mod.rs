//! Application Configuration
//!
//! Server, vision, and rendering settings stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::render::RenderSettings;
use crate::vision::VisionConfig;

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Page server settings
    pub server: ServerConfig,
    /// OCR settings
    pub vision: VisionConfig,
    /// Bounding box appearance
    pub render: RenderSettings,
}

/// Page server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Largest accepted request body in bytes
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8501,
            max_upload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// `bind:port` string for the listener
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Default location of the config file
pub fn default_config_path() -> Result<PathBuf> {
    Ok(crate::storage::get_config_dir()?.join("config.toml"))
}

/// Load an explicitly named config file, or the default one if it exists
///
/// An explicit path must exist; a missing default file means defaults.
pub fn load_or_default(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = load_config(path).with_context(|| format!("Failed to load config {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        return Ok(config);
    }

    if let Ok(path) = default_config_path() {
        if path.exists() {
            let config = load_config(&path).with_context(|| format!("Failed to load config {:?}", path))?;
            info!("Loaded configuration from {:?}", path);
            return Ok(config);
        }
    }

    info!("Using default configuration");
    Ok(AppConfig::default())
}
