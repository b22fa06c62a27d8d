//! TOML configuration loading
//!
//! Missing configuration files are not fatal: the loader logs a warning and
//! falls back to compiled defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Output name that selects a discarding sink instead of a real device
pub const TEST_OUTPUT: &str = "testoutput";

/// Largest accepted `buffer_time`, one hour
pub const MAX_BUFFER_TIME_MS: u64 = 60 * 60 * 1000;

/// Root of the TOML configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[audio]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Output element description, or `testoutput`
    pub output: String,

    /// Additional outputs fed from the same tee
    pub extra_outputs: Vec<String>,

    /// `software`, an element description, or `none`
    pub mixer: String,

    /// Initial mixer volume (0-100)
    pub mixer_volume: Option<u8>,

    /// Sink queue size in milliseconds
    pub buffer_time: Option<u64>,

    /// Visualizer element factory
    pub visualizer: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output: "autoaudiosink".to_string(),
            extra_outputs: Vec::new(),
            mixer: "software".to_string(),
            mixer_volume: None,
            buffer_time: None,
            visualizer: None,
        }
    }
}

/// How the `mixer` value should be interpreted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MixerKind {
    Software,
    /// Named mixer looked up in the mixer registry
    Named(String),
    Disabled,
}

impl AudioConfig {
    pub fn mixer_kind(&self) -> MixerKind {
        match self.mixer.trim() {
            "" | "none" => MixerKind::Disabled,
            "software" => MixerKind::Software,
            other => MixerKind::Named(other.to_string()),
        }
    }

    pub fn uses_test_output(&self) -> bool {
        self.output == TEST_OUTPUT
    }

    /// Every output description the tee should feed, primary first
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.output.as_str()).chain(self.extra_outputs.iter().map(String::as_str))
    }

    pub fn validate(&self) -> Result<()> {
        if self.output.trim().is_empty() {
            return Err(Error::Config("audio.output must not be empty".to_string()));
        }
        if let Some(volume) = self.mixer_volume {
            if volume > 100 {
                return Err(Error::Config(format!(
                    "audio.mixer_volume must be within 0-100, got {}",
                    volume
                )));
            }
        }
        if let Some(buffer_time) = self.buffer_time {
            if buffer_time > MAX_BUFFER_TIME_MS {
                return Err(Error::Config(format!(
                    "audio.buffer_time must be at most {} ms, got {}",
                    MAX_BUFFER_TIME_MS, buffer_time
                )));
            }
        }
        Ok(())
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Optional log file path (stdout when unset)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl TomlConfig {
    /// Parse and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TomlConfig = toml::from_str(&content)?;
        config.audio.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Like [`TomlConfig::load`], but a missing file yields defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Config file {} not found, using default configuration",
                path.display()
            );
            return Ok(Self::default());
        }
        Self::load(path)
    }
}
