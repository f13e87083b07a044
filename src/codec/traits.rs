//! Encoder trait definitions
//!
//! Any runtime-specific backend implements these. The capture engine only
//! sees `configure / encode / flush / close` and the chunks handed to its
//! output callback.

use crate::capture::VideoFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Encoder errors
#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Encoder unsupported: {0}")]
    Unsupported(String),

    #[error("Configuration rejected: {0}")]
    Configuration(String),

    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Encoder is not configured")]
    NotConfigured,

    #[error("Encoder is closed")]
    Closed,

    #[error("Encoder backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of an encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Unconfigured,
    Configured,
    Closed,
}

/// Video codecs the muxer can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264 High profile, level 4.0
    Avc,
}

impl VideoCodec {
    pub fn codec_string(&self) -> &'static str {
        match self {
            VideoCodec::Avc => "avc1.640028",
        }
    }
}

/// Audio codecs the muxer can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// AAC-LC
    Aac,
}

impl AudioCodec {
    pub fn codec_string(&self) -> &'static str {
        match self {
            AudioCodec::Aac => "mp4a.40.2",
        }
    }
}

/// Compressed bytes for one frame or audio buffer
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    /// Codec payload. H.264 access units use 4-byte length prefixes.
    pub data: Vec<u8>,

    /// Presentation timestamp in microseconds
    pub timestamp_us: u64,

    /// Duration in microseconds
    pub duration_us: u64,

    /// Sync sample flag
    pub is_key: bool,

    /// Out-of-band decoder configuration (avcC payload or AudioSpecificConfig).
    /// Present on the first chunk of a track.
    pub decoder_config: Option<Vec<u8>>,
}

/// Receives chunks as the encoder produces them, in submission order
pub type ChunkCallback = Box<dyn FnMut(EncodedChunk) + Send>;

/// Video encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoEncoderConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Distance between scheduled keyframes, in frames
    pub keyframe_interval: u32,
}

impl VideoEncoderConfig {
    pub fn validate(&self) -> Result<(), EncoderError> {
        if self.width == 0 || self.height == 0 {
            return Err(EncoderError::Configuration(format!(
                "invalid resolution {}x{}",
                self.width, self.height
            )));
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(EncoderError::Configuration(format!(
                "resolution {}x{} must be even",
                self.width, self.height
            )));
        }
        if self.bitrate == 0 || self.frame_rate == 0 || self.keyframe_interval == 0 {
            return Err(EncoderError::Configuration(
                "bitrate, frame rate and keyframe interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Nominal duration of one frame in microseconds
    pub fn frame_duration_us(&self) -> u64 {
        1_000_000 / self.frame_rate.max(1) as u64
    }
}

/// Audio encoder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioEncoderConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Target bitrate in bits per second
    pub bitrate: u32,
}

impl AudioEncoderConfig {
    pub fn validate(&self) -> Result<(), EncoderError> {
        if self.sample_rate == 0 || self.channels == 0 || self.bitrate == 0 {
            return Err(EncoderError::Configuration(format!(
                "invalid audio settings: {} Hz x {} ch @ {} bps",
                self.sample_rate, self.channels, self.bitrate
            )));
        }
        Ok(())
    }
}

/// Fixed-point samples with their presentation time.
///
/// Moved into the encoder on submission.
#[derive(Debug)]
pub struct AudioBuffer {
    /// Interleaved 16-bit samples
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
    pub timestamp_us: u64,
}

impl AudioBuffer {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_us(&self) -> u64 {
        self.frames() as u64 * 1_000_000 / self.sample_rate.max(1) as u64
    }
}

/// Stateful video encoder
pub trait VideoEncoder: Send {
    /// Apply settings. Fails when the backend rejects them.
    fn configure(&mut self, config: &VideoEncoderConfig) -> Result<(), EncoderError>;

    /// Submit one frame. The frame is consumed whether or not encoding succeeds.
    ///
    /// `key_frame` is a request, not a guarantee. Backends that fix their IDR
    /// schedule at configure time (every `keyframe_interval` frames) only
    /// honour requests that fall on that schedule and log the rest at debug.
    /// The emitted chunk's `is_key` is authoritative.
    fn encode(&mut self, frame: VideoFrame, key_frame: bool) -> Result<(), EncoderError>;

    /// Block until every submitted frame has been emitted
    fn flush(&mut self) -> Result<(), EncoderError>;

    /// Release backend resources. Safe to call more than once.
    fn close(&mut self);

    fn state(&self) -> EncoderState;
}

/// Stateful audio encoder
pub trait AudioEncoder: Send {
    fn configure(&mut self, config: &AudioEncoderConfig) -> Result<(), EncoderError>;

    /// Submit one buffer. The buffer is consumed whether or not encoding succeeds.
    fn encode(&mut self, buffer: AudioBuffer) -> Result<(), EncoderError>;

    fn flush(&mut self) -> Result<(), EncoderError>;

    fn close(&mut self);

    fn state(&self) -> EncoderState;
}

/// Creates encoder pairs for a backend
#[async_trait]
pub trait EncoderFactory: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Check that the backend can run here. Loads the backend on first use.
    async fn probe(&self) -> Result<(), EncoderError>;

    fn video_encoder(&self, output: ChunkCallback) -> Result<Box<dyn VideoEncoder>, EncoderError>;

    fn audio_encoder(&self, output: ChunkCallback) -> Result<Box<dyn AudioEncoder>, EncoderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_config(width: u32, height: u32) -> VideoEncoderConfig {
        VideoEncoderConfig {
            codec: VideoCodec::Avc,
            width,
            height,
            bitrate: 5_000_000,
            frame_rate: 30,
            keyframe_interval: 60,
        }
    }

    #[test]
    fn test_odd_resolution_is_rejected() {
        assert!(video_config(1278, 720).validate().is_ok());
        assert!(matches!(
            video_config(1279, 720).validate(),
            Err(EncoderError::Configuration(_))
        ));
        assert!(video_config(0, 720).validate().is_err());
    }

    #[test]
    fn test_codec_strings() {
        assert_eq!(VideoCodec::Avc.codec_string(), "avc1.640028");
        assert_eq!(AudioCodec::Aac.codec_string(), "mp4a.40.2");
    }

    #[test]
    fn test_audio_buffer_duration() {
        let buffer = AudioBuffer {
            samples: vec![0; 4800],
            channels: 2,
            sample_rate: 48_000,
            timestamp_us: 0,
        };
        assert_eq!(buffer.frames(), 2400);
        assert_eq!(buffer.duration_us(), 50_000);
    }
}
