//! Synthetic test-pattern source
//!
//! Stands in for a camera/microphone provider: moving color bars for video
//! and a sine tone for audio. Used by the demo binary and by tests.

use super::traits::{AudioFeed, MediaSource, Picture, SourceError, TrackInfo, TrackKind, TrackSettings};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const TONE_HZ: f32 = 440.0;
const AUDIO_BLOCK_MS: u64 = 10;

/// Test-pattern media source
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_rate: f64,
    sample_rate: Option<u32>,
    stopped: Arc<AtomicBool>,
    audio_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TestPatternSource {
    /// Video-only source
    pub fn new(width: u32, height: u32, frame_rate: f64) -> Self {
        Self {
            width,
            height,
            frame_rate,
            sample_rate: None,
            stopped: Arc::new(AtomicBool::new(false)),
            audio_thread: Mutex::new(None),
        }
    }

    /// Add a mono sine-tone audio track
    pub fn with_audio(mut self, sample_rate: u32) -> Self {
        self.sample_rate = Some(sample_rate);
        self
    }

    /// Render the picture for a given frame number
    pub fn picture(&self, frame_number: u64) -> Picture {
        let (width, height) = (self.width, self.height);
        let shift = (frame_number * 4 % width.max(1) as u64) as u32;
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);

        for y in 0..height {
            for x in 0..width {
                let bar = ((x + shift) % width.max(1)) * 8 / width.max(1);
                let shade = (y * 255 / height.max(1)) as u8;
                let (r, g, b) = match bar {
                    0 => (255, 255, 255),
                    1 => (255, 255, 0),
                    2 => (0, 255, 255),
                    3 => (0, 255, 0),
                    4 => (255, 0, 255),
                    5 => (255, 0, 0),
                    6 => (0, 0, 255),
                    _ => (shade, shade, shade),
                };
                rgba.extend_from_slice(&[r, g, b, 255]);
            }
        }

        Picture::new(width, height, rgba)
    }
}

impl MediaSource for TestPatternSource {
    fn tracks(&self) -> Vec<TrackInfo> {
        let mut tracks = vec![TrackInfo {
            id: "test-pattern-video".to_string(),
            kind: TrackKind::Video,
            settings: TrackSettings {
                width: Some(self.width),
                height: Some(self.height),
                frame_rate: Some(self.frame_rate),
                ..Default::default()
            },
        }];

        if let Some(sample_rate) = self.sample_rate {
            tracks.push(TrackInfo {
                id: "test-pattern-audio".to_string(),
                kind: TrackKind::Audio,
                settings: TrackSettings {
                    sample_rate: Some(sample_rate),
                    channel_count: Some(1),
                    ..Default::default()
                },
            });
        }

        tracks
    }

    fn open_audio(&self) -> Result<AudioFeed, SourceError> {
        let sample_rate = self
            .sample_rate
            .ok_or(SourceError::MissingTrack(TrackKind::Audio))?;
        if self.stopped.load(Ordering::Relaxed) {
            return Err(SourceError::Stopped);
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        let stopped = self.stopped.clone();
        let block_len = (sample_rate as u64 * AUDIO_BLOCK_MS / 1000) as usize;

        let handle = std::thread::Builder::new()
            .name("test-pattern-audio".into())
            .spawn(move || {
                let mut phase = 0.0f32;
                let step = TONE_HZ * std::f32::consts::TAU / sample_rate as f32;
                while !stopped.load(Ordering::Relaxed) {
                    let block: Vec<f32> = (0..block_len)
                        .map(|_| {
                            let sample = phase.sin() * 0.25;
                            phase = (phase + step) % std::f32::consts::TAU;
                            sample
                        })
                        .collect();
                    if tx.send(block).is_err() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(AUDIO_BLOCK_MS));
                }
            })
            .map_err(|e| SourceError::AudioUnavailable(e.to_string()))?;

        *self.audio_thread.lock() = Some(handle);

        Ok(AudioFeed {
            sample_rate,
            channels: 1,
            blocks: rx,
        })
    }

    fn stop_all(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        if let Some(handle) = self.audio_thread.lock().take() {
            let _ = handle.join();
        }
        tracing::debug!("Test pattern source stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picture_matches_dimensions() {
        let source = TestPatternSource::new(17, 9, 30.0);
        let picture = source.picture(3);
        assert!(picture.is_well_formed());
        assert_eq!((picture.width, picture.height), (17, 9));
    }

    #[test]
    fn test_video_only_source_has_no_audio() {
        let source = TestPatternSource::new(16, 16, 30.0);
        assert!(!source.has_audio());
        assert!(matches!(
            source.open_audio(),
            Err(SourceError::MissingTrack(TrackKind::Audio))
        ));
    }

    #[test]
    fn test_audio_feed_produces_blocks_until_stopped() {
        let source = TestPatternSource::new(16, 16, 30.0).with_audio(48_000);
        let feed = source.open_audio().unwrap();
        let block = feed.blocks.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(block.len(), 480);
        assert!(block.iter().all(|s| (-1.0..=1.0).contains(s)));

        source.stop_all();
        // Drain whatever was queued; the sender is gone after the thread exits
        while feed.blocks.recv_timeout(Duration::from_millis(200)).is_ok() {}
    }
}
