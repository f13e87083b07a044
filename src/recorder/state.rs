//! Recording state management
//!
//! Defines the recording state machine, pause/resume segment tracking and
//! the options a session starts with.

use crate::config::CaptureSettings;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Current state of the recording system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// No recording in progress
    Idle,
    /// Encoders and muxer being set up
    Starting,
    /// Currently recording
    Recording,
    /// Recording is paused
    Paused,
    /// Flushing encoders and finalizing output
    Stopping,
}

impl Default for RecordingState {
    fn default() -> Self {
        Self::Idle
    }
}

impl RecordingState {
    /// Whether frames and samples are accepted in this state
    pub fn is_capturing(&self) -> bool {
        *self == RecordingState::Recording
    }

    /// Whether a session exists in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            RecordingState::Starting | RecordingState::Recording | RecordingState::Paused
        )
    }
}

/// One uninterrupted stretch of recording
///
/// A new segment is started each time recording is resumed after a pause.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSegment {
    /// Segment index (0, 1, 2, ...)
    pub index: usize,

    /// Duration of this segment in milliseconds
    pub duration_ms: f64,

    /// Process time when segment started (relative to session start)
    pub process_time_start_ms: f64,

    /// Process time when segment ended
    pub process_time_end_ms: f64,

    /// Unix timestamp when segment started
    pub unix_start_ms: u64,

    /// Unix timestamp when segment ended
    pub unix_end_ms: u64,
}

impl RecordingSegment {
    /// Create a new segment starting now
    pub fn new(index: usize, process_time_ms: f64) -> Self {
        let now = Utc::now().timestamp_millis() as u64;
        Self {
            index,
            duration_ms: 0.0,
            process_time_start_ms: process_time_ms,
            process_time_end_ms: process_time_ms,
            unix_start_ms: now,
            unix_end_ms: now,
        }
    }

    /// End the segment
    pub fn end(&mut self, process_time_ms: f64) {
        self.process_time_end_ms = process_time_ms;
        self.duration_ms = self.process_time_end_ms - self.process_time_start_ms;
        self.unix_end_ms = Utc::now().timestamp_millis() as u64;
    }
}

/// Total recorded time, excluding pauses.
///
/// The last segment is still open when `open_until_ms` is given.
pub fn recorded_duration_ms(segments: &[RecordingSegment], open_until_ms: Option<f64>) -> f64 {
    let closed: f64 = segments
        .iter()
        .take(segments.len().saturating_sub(1))
        .map(|s| s.duration_ms)
        .sum();

    let last = match (segments.last(), open_until_ms) {
        (Some(segment), Some(now)) => now - segment.process_time_start_ms,
        (Some(segment), None) => segment.duration_ms,
        (None, _) => 0.0,
    };

    closed + last
}

/// Options a recording session starts with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Requested capture width; odd values are rounded down
    pub width: u32,
    /// Requested capture height; odd values are rounded down
    pub height: u32,
    pub frame_rate: u32,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
}

impl StartOptions {
    pub fn new(width: u32, height: u32) -> Self {
        Self::from_settings(width, height, &CaptureSettings::default())
    }

    pub fn from_settings(width: u32, height: u32, settings: &CaptureSettings) -> Self {
        Self {
            width,
            height,
            frame_rate: settings.frame_rate,
            video_bitrate: settings.video_bitrate,
            audio_bitrate: settings.audio_bitrate,
        }
    }

    pub fn with_frame_rate(mut self, frame_rate: u32) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Encoder dimensions: each odd dimension minus one
    pub fn even_dimensions(&self) -> (u32, u32) {
        (self.width & !1, self.height & !1)
    }

    /// Frame rate with a floor of 1
    pub fn effective_frame_rate(&self) -> u32 {
        self.frame_rate.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_dimensions() {
        assert_eq!(StartOptions::new(1279, 721).even_dimensions(), (1278, 720));
        assert_eq!(StartOptions::new(1280, 720).even_dimensions(), (1280, 720));
        assert_eq!(StartOptions::new(1, 3).even_dimensions(), (0, 2));
    }

    #[test]
    fn test_default_frame_rate() {
        let options = StartOptions::new(640, 480);
        assert_eq!(options.frame_rate, 30);
        assert_eq!(options.with_frame_rate(0).effective_frame_rate(), 1);
    }

    #[test]
    fn test_recorded_duration_excludes_pauses() {
        let mut first = RecordingSegment::new(0, 0.0);
        first.end(1_000.0);
        let second = RecordingSegment::new(1, 4_000.0);

        let segments = vec![first, second];
        assert_eq!(recorded_duration_ms(&segments, Some(4_500.0)), 1_500.0);
        assert_eq!(recorded_duration_ms(&segments, None), 1_000.0);
        assert_eq!(recorded_duration_ms(&[], None), 0.0);
    }

    #[test]
    fn test_state_predicates() {
        assert!(RecordingState::Recording.is_capturing());
        assert!(!RecordingState::Paused.is_capturing());
        assert!(RecordingState::Paused.is_active());
        assert!(!RecordingState::Idle.is_active());
        assert!(!RecordingState::Stopping.is_active());
    }
}
