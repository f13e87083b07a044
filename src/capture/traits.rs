//! Capture trait definitions
//!
//! The media source abstraction the capture engine attaches to. Camera and
//! microphone acquisition live outside this crate; providers implement
//! [`MediaSource`].

use crossbeam_channel::Receiver;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Media source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source has no {0} track")]
    MissingTrack(TrackKind),

    #[error("Source already stopped")]
    Stopped,

    #[error("Audio feed unavailable: {0}")]
    AudioUnavailable(String),
}

/// Kind of a live track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Video => write!(f, "video"),
            TrackKind::Audio => write!(f, "audio"),
        }
    }
}

/// Capability settings snapshot of a live track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSettings {
    /// Width in pixels (video)
    pub width: Option<u32>,

    /// Height in pixels (video)
    pub height: Option<u32>,

    /// Frames per second (video)
    pub frame_rate: Option<f64>,

    /// Samples per second (audio)
    pub sample_rate: Option<u32>,

    /// Channel count (audio)
    pub channel_count: Option<u16>,
}

/// A live track exposed by a media source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub settings: TrackSettings,
}

/// An RGBA picture handed to the engine by the render loop
#[derive(Debug, Clone)]
pub struct Picture {
    pub width: u32,
    pub height: u32,
    /// Tightly packed RGBA, `width * height * 4` bytes
    pub rgba: Vec<u8>,
}

impl Picture {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        Self { width, height, rgba }
    }

    /// Whether the buffer length matches the declared dimensions
    pub fn is_well_formed(&self) -> bool {
        self.rgba.len() == self.width as usize * self.height as usize * 4
    }

    /// Crop to the top-left `width x height` region.
    ///
    /// Returns the picture unchanged when it already has that size.
    pub fn cropped(self, width: u32, height: u32) -> Picture {
        if self.width == width && self.height == height {
            return self;
        }
        let width = width.min(self.width);
        let height = height.min(self.height);
        let src_stride = self.width as usize * 4;
        let dst_stride = width as usize * 4;

        let mut rgba = Vec::with_capacity(dst_stride * height as usize);
        for row in self.rgba.chunks_exact(src_stride).take(height as usize) {
            rgba.extend_from_slice(&row[..dst_stride]);
        }
        Picture { width, height, rgba }
    }
}

/// Raw picture sample with its presentation time.
///
/// Moved into the encoder on submission and dropped right after, so the
/// pixel buffer never outlives the encode call.
#[derive(Debug)]
pub struct VideoFrame {
    pub picture: Picture,
    pub timestamp_us: u64,
    pub duration_us: u64,
}

/// Live float sample blocks from an audio track.
///
/// Samples are interleaved and nominally in `[-1.0, 1.0]`. The feed ends when
/// the sender side is dropped.
pub struct AudioFeed {
    pub sample_rate: u32,
    pub channels: u16,
    pub blocks: Receiver<Vec<f32>>,
}

/// A live camera/microphone handle.
///
/// Shared between the preview and the capture engine: only the engine
/// attaches encoders, only the preview renders.
pub trait MediaSource: Send + Sync {
    /// All live tracks
    fn tracks(&self) -> Vec<TrackInfo>;

    /// Open a feed of raw samples from the first audio track
    fn open_audio(&self) -> Result<AudioFeed, SourceError>;

    /// Stop every track. Called on session end or teardown.
    fn stop_all(&self);

    /// Settings of the first video track
    fn video_settings(&self) -> Option<TrackSettings> {
        self.tracks()
            .into_iter()
            .find(|t| t.kind == TrackKind::Video)
            .map(|t| t.settings)
    }

    /// Whether any audio track is present
    fn has_audio(&self) -> bool {
        self.tracks().iter().any(|t| t.kind == TrackKind::Audio)
    }
}
