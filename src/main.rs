//! textlens - Upload an image, read its text
//!
//! A small web page that extracts text from an uploaded image or draws the
//! detected text regions onto it.

mod app;
mod config;
mod render;
mod storage;
mod vision;
mod web;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app::DispatchSettings;
use crate::config::AppConfig;
use crate::vision::{ModelManager, VisionPipeline};

/// textlens - image text extraction and detection page
#[derive(Parser, Debug)]
#[command(name = "textlens")]
#[command(about = "Upload an image and extract or outline its text", version)]
struct Args {
    /// Config file (defaults to config.toml in the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Model cache directory
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Never use GPU acceleration
    #[arg(long)]
    no_gpu: bool,

    /// Do not download missing models
    #[arg(long)]
    offline: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Write the effective configuration to the config file and exit
    #[arg(long)]
    save_config: bool,
}

impl Args {
    /// Command line flags override the config file
    fn apply(&self, config: &mut AppConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(dir) = &self.models_dir {
            config.vision.models_dir = Some(dir.clone());
        }
        if self.no_gpu {
            config.vision.use_gpu = false;
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = config::load_or_default(args.config.as_deref())?;
    args.apply(&mut config);

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    if args.save_config {
        let path = match &args.config {
            Some(path) => path.clone(),
            None => config::default_config_path()?,
        };
        config::save_config(&config, &path)?;
        info!("Configuration saved to {:?}", path);
        return Ok(());
    }

    vision::validate_languages(&config.vision.languages)?;

    info!("textlens {} starting...", env!("CARGO_PKG_VERSION"));

    let model_manager = match &config.vision.models_dir {
        Some(dir) => ModelManager::with_dir(dir.clone())?,
        None => ModelManager::new()?,
    }
    .offline(args.offline);
    info!("Model cache: {:?}", model_manager.models_dir());

    // Pages still render without models; uploads then report what is missing
    if let Err(e) = model_manager.ensure_all_models().await {
        warn!("OCR models not ready: {:#}", e);
    }

    let settings = DispatchSettings {
        languages: config.vision.languages.clone(),
        render: config.render.clone(),
    };
    let pipeline = VisionPipeline::new(config.vision.clone(), model_manager);
    if pipeline.are_models_ready() {
        info!("OCR models ready");
    }
    let state = web::AppState::new(Box::new(pipeline), settings);

    web::serve(&config.server, state).await?;

    info!("textlens shutdown complete");

    Ok(())
}
