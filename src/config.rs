use crate::audio::codec::OPUS_RATES;
use crate::services::SessionConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Capture rates to try, in order
    #[serde(default = "default_sample_rates")]
    pub sample_rates: Vec<u32>,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_bit_depth")]
    pub bit_depth: u16,

    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Opus bitrate in bits per second
    #[serde(default = "default_bitrate")]
    pub bitrate: i32,

    /// Chunks buffered between the decryptor and the consumer
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Defaults to the system temp directory
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    #[serde(default = "default_outbox_dir")]
    pub outbox_dir: PathBuf,

    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_sample_rates() -> Vec<u32> {
    vec![44100, 8000, 11025, 22050]
}

fn default_channels() -> u16 {
    1
}

fn default_bit_depth() -> u16 {
    16
}

fn default_output_sample_rate() -> u32 {
    16000
}

fn default_bitrate() -> i32 {
    16000
}

fn default_pipe_capacity() -> usize {
    16
}

fn default_outbox_dir() -> PathBuf {
    data_dir().join("outbox")
}

fn default_inbox_dir() -> PathBuf {
    data_dir().join("inbox")
}

fn default_max_retries() -> u32 {
    2
}

fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(dir).join("ptt-voice");
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/ptt-voice"),
        Err(_) => std::env::temp_dir().join("ptt-voice"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rates: default_sample_rates(),
            channels: default_channels(),
            bit_depth: default_bit_depth(),
            output_sample_rate: default_output_sample_rate(),
            bitrate: default_bitrate(),
            pipe_capacity: default_pipe_capacity(),
            scratch_dir: None,
            outbox_dir: default_outbox_dir(),
            inbox_dir: default_inbox_dir(),
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.config/ptt-voice/config.json)
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let config = Self::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

        tracing::info!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(dir)
        } else {
            let home = std::env::var("HOME").context("HOME environment variable not set")?;
            PathBuf::from(home).join(".config")
        };

        Ok(config_dir.join("ptt-voice").join("config.json"))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.sample_rates.is_empty() {
            return Err(anyhow::anyhow!("sample_rates cannot be empty"));
        }

        if let Some(rate) = self.sample_rates.iter().find(|r| **r == 0) {
            return Err(anyhow::anyhow!("invalid sample rate: {}", rate));
        }

        if !(1..=2).contains(&self.channels) {
            return Err(anyhow::anyhow!("channels must be 1 or 2"));
        }

        if ![8, 16].contains(&self.bit_depth) {
            return Err(anyhow::anyhow!("bit_depth must be 8 or 16"));
        }

        if !OPUS_RATES.contains(&self.output_sample_rate) {
            return Err(anyhow::anyhow!(
                "output_sample_rate must be one of: {:?}",
                OPUS_RATES
            ));
        }

        if !(500..=512_000).contains(&self.bitrate) {
            return Err(anyhow::anyhow!("bitrate must be between 500 and 512000"));
        }

        if self.pipe_capacity == 0 {
            return Err(anyhow::anyhow!("pipe_capacity must be at least 1"));
        }

        Ok(())
    }

    /// Settings for the session controller
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            sample_rates: self.sample_rates.clone(),
            channels: self.channels,
            bit_depth: self.bit_depth,
            output_sample_rate: self.output_sample_rate,
            bitrate: self.bitrate,
            pipe_capacity: self.pipe_capacity,
            scratch_dir: self
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }
}
