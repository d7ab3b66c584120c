//! Configuration management for Cadenza
//!
//! This module provides:
//! - Configuration structs for the editor, effect tuning and external tools
//! - Effect presets with TOML serialization
//! - A config manager with factory-default fallback

use crate::domain::codec::ExportFormat;
use crate::domain::params::EffectParams;
use crate::domain::preview::PreviewConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, instrument};

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Errors that can occur during configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Preset not found: {0}")]
    PresetNotFound(String),
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Frames per chunk pushed to the output stream during preview
    pub preview_chunk_frames: usize,

    /// Playhead notification interval in milliseconds
    pub position_interval_ms: u64,

    /// Background job polling interval in milliseconds
    pub job_poll_interval_ms: u64,

    /// Maximum undo depth (0 = unbounded)
    pub history_limit: usize,

    /// Format used when export is given no explicit format
    pub default_export_format: ExportFormat,

    /// Preset directory
    pub preset_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            preview_chunk_frames: 512,
            position_interval_ms: 100,
            job_poll_interval_ms: 100,
            history_limit: 64,
            default_export_format: ExportFormat::Mp3,
            preset_dir: PathBuf::from("presets"),
        }
    }
}

impl AppConfig {
    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms.max(1))
    }

    /// Preview settings; artifacts go to the system temp directory
    pub fn preview_config(&self) -> PreviewConfig {
        PreviewConfig {
            chunk_frames: self.preview_chunk_frames.max(1),
            position_interval: Duration::from_millis(self.position_interval_ms.max(1)),
            artifact_dir: std::env::temp_dir(),
        }
    }
}

/// Fixed arguments of the effects that have no user-facing knob
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectTuning {
    pub reverb_wet_level: f32,
    /// Moving-sum window of the reverb, in samples
    pub reverb_window: usize,
    pub echo_delay_ms: f32,
    pub echo_decay: f32,
    pub fade_in_ms: f32,
    pub fade_out_ms: f32,
}

impl Default for EffectTuning {
    fn default() -> Self {
        Self {
            reverb_wet_level: 0.2,
            reverb_window: 1000,
            echo_delay_ms: 500.0,
            echo_decay: 0.5,
            fade_in_ms: 1000.0,
            fade_out_ms: 1000.0,
        }
    }
}

/// External programs the infra layer shells out to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Transcoder used for every export format except wav
    pub ffmpeg_path: PathBuf,

    /// Source-separation program
    pub separator_program: PathBuf,

    /// Arguments; `{input}` and `{output}` are substituted
    pub separator_args: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            separator_program: PathBuf::from("spleeter"),
            separator_args: vec![
                "separate".to_string(),
                "-p".to_string(),
                "spleeter:2stems".to_string(),
                "-o".to_string(),
                "{output}".to_string(),
                "-f".to_string(),
                "{instrument}.wav".to_string(),
                "{input}".to_string(),
            ],
        }
    }
}

/// Complete Cadenza configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenzaConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub effects: EffectTuning,
    #[serde(default)]
    pub tools: ToolsConfig,
}

impl CadenzaConfig {
    /// Load configuration from TOML file
    #[instrument(skip(path))]
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = fs::read_to_string(path).await?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;

        debug!("Configuration loaded successfully");
        Ok(config)
    }

    /// Save configuration to TOML file
    #[instrument(skip(self, path))]
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        fs::write(path, toml_str).await?;

        debug!("Configuration saved successfully");
        Ok(())
    }

    /// Create factory default configuration
    pub fn factory_default() -> Self {
        Self::default()
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.effects.reverb_window == 0 {
            return Err(ConfigError::Invalid(
                "effects.reverb_window must be at least 1".to_string(),
            ));
        }
        if !(self.effects.echo_delay_ms >= 0.0) {
            return Err(ConfigError::Invalid(
                "effects.echo_delay_ms must not be negative".to_string(),
            ));
        }
        if !(self.effects.fade_in_ms >= 0.0 && self.effects.fade_out_ms >= 0.0) {
            return Err(ConfigError::Invalid(
                "effects fade lengths must not be negative".to_string(),
            ));
        }
        if self.app.preview_chunk_frames == 0 {
            return Err(ConfigError::Invalid(
                "app.preview_chunk_frames must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stores named effect parameter sets as `<preset_dir>/<name>.toml`
pub struct PresetManager {
    preset_dir: PathBuf,
}

impl PresetManager {
    /// Create a new preset manager
    pub fn new(preset_dir: PathBuf) -> Self {
        Self { preset_dir }
    }

    fn preset_path(&self, name: &str) -> PathBuf {
        self.preset_dir.join(format!("{}.toml", name))
    }

    /// List all available presets
    #[instrument(skip(self))]
    pub async fn list_presets(&self) -> Result<Vec<String>> {
        let mut presets = Vec::new();

        if !self.preset_dir.exists() {
            return Ok(presets);
        }

        let mut entries = fs::read_dir(&self.preset_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "toml").unwrap_or(false) {
                if let Some(name) = path.file_stem().and_then(|n| n.to_str()) {
                    presets.push(name.to_string());
                }
            }
        }

        presets.sort();
        debug!(count = presets.len(), "Listed presets");
        Ok(presets)
    }

    /// Load a preset by name
    #[instrument(skip(self))]
    pub async fn load_preset(&self, name: &str) -> Result<EffectParams> {
        let path = self.preset_path(name);

        if !path.exists() {
            return Err(ConfigError::PresetNotFound(name.to_string()));
        }

        let contents = fs::read_to_string(&path).await?;
        let params: EffectParams = toml::from_str(&contents)?;
        params
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(params)
    }

    /// Save a preset by name
    #[instrument(skip(self, params))]
    pub async fn save_preset(&self, name: &str, params: &EffectParams) -> Result<()> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!("Invalid preset name: {:?}", name)));
        }
        fs::create_dir_all(&self.preset_dir).await?;

        let toml_str = toml::to_string_pretty(params)?;
        fs::write(self.preset_path(name), toml_str).await?;
        info!(name, "Preset saved");
        Ok(())
    }

    /// Delete a preset by name
    #[instrument(skip(self))]
    pub async fn delete_preset(&self, name: &str) -> Result<()> {
        let path = self.preset_path(name);

        if !path.exists() {
            return Err(ConfigError::PresetNotFound(name.to_string()));
        }

        fs::remove_file(&path).await?;
        info!(name, "Preset deleted");
        Ok(())
    }

    /// Check if a preset exists
    pub async fn preset_exists(&self, name: &str) -> bool {
        self.preset_path(name).exists()
    }
}

/// Owns the main configuration file at `<config dir>/cadenza/config.toml`
pub struct ConfigManager {
    config_dir: PathBuf,
    config_path: PathBuf,
}

impl ConfigManager {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_path = config_dir.join("config.toml");
        Self {
            config_dir,
            config_path,
        }
    }

    /// Default config directory
    ///
    /// Returns `~/.config/cadenza` on Linux, the platform equivalent elsewhere
    pub fn default_config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("cadenza"))
            .ok_or_else(|| ConfigError::Invalid("Could not determine config directory".to_string()))
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load configuration from file
    ///
    /// A missing file yields (and writes) the factory default. A corrupt one
    /// is backed up as `config.toml.corrupt` and the factory default returned.
    #[instrument(skip(self))]
    pub async fn load(&self) -> CadenzaConfig {
        if !self.config_path.exists() {
            info!(
                path = %self.config_path.display(),
                "Config file not found, creating factory default"
            );

            let config = CadenzaConfig::factory_default();
            if let Err(e) = config.save_to_file(&self.config_path).await {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to save factory default config"
                );
            }
            return config;
        }

        match CadenzaConfig::load_from_file(&self.config_path).await {
            Ok(config) => config,
            Err(e) => {
                error!(
                    path = %self.config_path.display(),
                    error = %e,
                    "Failed to load config, using factory default"
                );

                let backup_path = self.config_path.with_extension("toml.corrupt");
                if let Err(copy_err) = fs::copy(&self.config_path, &backup_path).await {
                    error!(
                        path = %backup_path.display(),
                        error = %copy_err,
                        "Failed to backup corrupt config"
                    );
                }

                CadenzaConfig::factory_default()
            }
        }
    }

    #[instrument(skip(self, config))]
    pub async fn save(&self, config: &CadenzaConfig) -> Result<()> {
        fs::create_dir_all(&self.config_dir).await?;
        config.save_to_file(&self.config_path).await
    }

    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }
}
