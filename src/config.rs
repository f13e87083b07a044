//! Application configuration
//!
//! Loaded from `<config_dir>/easycord/config.toml`. Every field has a default,
//! so a missing file or a partial file is valid.

use crate::audio::AudioProcessingMode;
use crate::recorder::timeline::TimestampMode;
use crate::trigger::TriggerCommand;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Capture engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CaptureSettings {
    pub frame_rate: u32,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u16,
    /// Frames discarded at session start while the encoder settles
    pub warmup_frames: u32,
    pub keyframe_interval_secs: u32,
    pub timestamp_mode: TimestampMode,
    pub audio_processing: AudioProcessingMode,
    /// Samples per channel in each converted audio block
    pub audio_block_frames: usize,
    /// Bound of the converter → encoder channel, in blocks
    pub audio_channel_capacity: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_rate: 30,
            video_bitrate: 5_000_000,
            audio_bitrate: 128_000,
            audio_sample_rate: 48_000,
            audio_channels: 1,
            warmup_frames: 5,
            keyframe_interval_secs: 2,
            timestamp_mode: TimestampMode::ConstantFrameRate,
            audio_processing: AudioProcessingMode::Dedicated,
            audio_block_frames: 4096,
            audio_channel_capacity: 32,
        }
    }
}

/// Fallback transcode settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TranscodeSettings {
    /// Explicit FFmpeg binary; looked up on PATH when unset
    pub ffmpeg_path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub output_frame_rate: u32,
}

impl TranscodeSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            timeout_secs: 300,
            output_frame_rate: 30,
        }
    }
}

/// Where finished recordings go
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct OutputSettings {
    pub directory: PathBuf,
    pub filename_prefix: String,
}

impl Default for OutputSettings {
    fn default() -> Self {
        let directory = dirs::video_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            directory,
            filename_prefix: "recording".to_string(),
        }
    }
}

/// Trigger debounce settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct TriggerSettings {
    /// Consecutive identical observations needed before a command fires
    pub confirmation_frames: u32,
    /// Observed label → command
    pub bindings: HashMap<String, TriggerCommand>,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        let bindings = HashMap::from([
            ("Open_Palm".to_string(), TriggerCommand::Start),
            ("Closed_Fist".to_string(), TriggerCommand::Stop),
            ("Victory".to_string(), TriggerCommand::Reset),
        ]);
        Self {
            confirmation_frames: 15,
            bindings,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub capture: CaptureSettings,
    pub transcode: TranscodeSettings,
    pub output: OutputSettings,
    pub trigger: TriggerSettings,
}

impl AppConfig {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("easycord")
            .join("config.toml")
    }

    /// Load from the default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Load from an explicit path. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Parse TOML content and validate it
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let capture = &self.capture;
        if capture.frame_rate == 0 {
            return Err(ConfigError::Invalid("frame_rate must be positive".into()));
        }
        if capture.audio_sample_rate == 0 || capture.audio_channels == 0 {
            return Err(ConfigError::Invalid(
                "audio sample rate and channel count must be positive".into(),
            ));
        }
        if capture.audio_block_frames == 0 || capture.audio_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "audio block size and channel capacity must be positive".into(),
            ));
        }
        if self.trigger.confirmation_frames == 0 {
            return Err(ConfigError::Invalid(
                "confirmation_frames must be positive".into(),
            ));
        }
        Ok(())
    }
}
