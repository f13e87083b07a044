//! Presentation timestamps for both tracks
//!
//! Video and audio share one [`SessionClock`], which excludes paused time, and
//! one [`SyncAnchor`]: the session time of the first accepted video frame.
//! Both tracks count from that anchor, so the first picture and the audio
//! captured alongside it both land at zero. A build picks one
//! [`TimestampMode`] and applies it to both tracks.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How presentation timestamps are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TimestampMode {
    /// Video from the accepted-frame count, audio from the sample count
    ConstantFrameRate,
    /// Both tracks from elapsed session time
    WallClock,
}

impl Default for TimestampMode {
    fn default() -> Self {
        Self::ConstantFrameRate
    }
}

/// Monotonic time source
pub trait Clock: Send + Sync {
    /// Time since an arbitrary fixed origin
    fn now(&self) -> Duration;
}

/// [`Clock`] backed by `Instant`
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock
#[derive(Default)]
pub struct ManualClock {
    now: Mutex<Duration>,
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

struct PauseState {
    started_at: Duration,
    paused_total: Duration,
    paused_at: Option<Duration>,
}

/// Session-relative elapsed time with paused intervals removed
#[derive(Clone)]
pub struct SessionClock {
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<PauseState>>,
}

impl SessionClock {
    /// Start counting from now
    pub fn start(clock: Arc<dyn Clock>) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            state: Arc::new(Mutex::new(PauseState {
                started_at,
                paused_total: Duration::ZERO,
                paused_at: None,
            })),
        }
    }

    /// Active recording time. Frozen while paused.
    pub fn elapsed(&self) -> Duration {
        let state = self.state.lock();
        let now = state.paused_at.unwrap_or_else(|| self.clock.now());
        now.saturating_sub(state.started_at)
            .saturating_sub(state.paused_total)
    }

    pub fn elapsed_us(&self) -> u64 {
        self.elapsed().as_micros() as u64
    }

    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.paused_at.is_none() {
            state.paused_at = Some(self.clock.now());
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock();
        if let Some(at) = state.paused_at.take() {
            state.paused_total += self.clock.now().saturating_sub(at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused_at.is_some()
    }

    pub fn paused_total(&self) -> Duration {
        self.state.lock().paused_total
    }
}

/// Session time of the first accepted video frame, shared by both tracks
#[derive(Clone, Default)]
pub struct SyncAnchor {
    at_us: Arc<Mutex<Option<u64>>>,
}

impl SyncAnchor {
    /// Set the anchor unless it is already set. Returns the anchor in effect.
    pub fn set(&self, session_us: u64) -> u64 {
        *self.at_us.lock().get_or_insert(session_us)
    }

    pub fn get(&self) -> Option<u64> {
        *self.at_us.lock()
    }
}

/// Video timeline parameters
#[derive(Debug, Clone, Copy)]
pub struct TimelineConfig {
    pub frame_rate: u32,
    pub warmup_frames: u32,
    pub keyframe_interval_secs: u32,
    pub mode: TimestampMode,
}

/// Timing assigned to an accepted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Index among accepted frames, starting at 0
    pub index: u64,
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub key_frame: bool,
}

/// What to do with an offered frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    Accept(FrameSlot),
    /// Discarded while the encoder warms up
    WarmUp,
    /// Arrived sooner than the frame interval after the last accepted frame
    Throttled,
    /// Timestamp would not advance past the last one
    OutOfOrder { previous_us: u64, candidate_us: u64 },
}

/// Assigns timestamps and keyframe flags to frames offered by the render loop
pub struct VideoTimeline {
    config: TimelineConfig,
    clock: SessionClock,
    anchor: SyncAnchor,
    /// Every offered frame, warm-up included
    offered: u64,
    accepted: u64,
    last_accepted_at: Option<Duration>,
    last_timestamp_us: Option<u64>,
}

impl VideoTimeline {
    pub fn new(config: TimelineConfig, clock: SessionClock, anchor: SyncAnchor) -> Self {
        Self {
            config: TimelineConfig {
                frame_rate: config.frame_rate.max(1),
                keyframe_interval_secs: config.keyframe_interval_secs.max(1),
                ..config
            },
            clock,
            anchor,
            offered: 0,
            accepted: 0,
            last_accepted_at: None,
            last_timestamp_us: None,
        }
    }

    pub fn frame_duration_us(&self) -> u64 {
        1_000_000 / self.config.frame_rate as u64
    }

    /// Frames between forced keyframes
    pub fn keyframe_interval(&self) -> u64 {
        self.config.frame_rate as u64 * self.config.keyframe_interval_secs as u64
    }

    pub fn offered(&self) -> u64 {
        self.offered
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn clock(&self) -> &SessionClock {
        &self.clock
    }

    pub fn anchor(&self) -> &SyncAnchor {
        &self.anchor
    }

    /// Decide the fate of the next frame from the render loop
    pub fn next_frame(&mut self) -> FrameDecision {
        self.offered += 1;
        if self.offered <= self.config.warmup_frames as u64 {
            return FrameDecision::WarmUp;
        }

        let now = self.clock.elapsed();
        if let Some(last) = self.last_accepted_at {
            if (now.saturating_sub(last).as_micros() as u64) < self.frame_duration_us() {
                return FrameDecision::Throttled;
            }
        }

        let now_us = now.as_micros() as u64;
        let anchor_us = self.anchor.get().unwrap_or(now_us);
        let candidate_us = match self.config.mode {
            TimestampMode::ConstantFrameRate => {
                self.accepted * 1_000_000 / self.config.frame_rate as u64
            }
            TimestampMode::WallClock => now_us.saturating_sub(anchor_us),
        };

        if let Some(previous_us) = self.last_timestamp_us {
            if candidate_us <= previous_us {
                return FrameDecision::OutOfOrder {
                    previous_us,
                    candidate_us,
                };
            }
        }

        let index = self.accepted;
        let key_frame = index == 0 || index % self.keyframe_interval() == 0;
        if index == 0 {
            self.anchor.set(now_us);
        }

        self.accepted += 1;
        self.last_accepted_at = Some(now);
        self.last_timestamp_us = Some(candidate_us);

        FrameDecision::Accept(FrameSlot {
            index,
            timestamp_us: candidate_us,
            duration_us: self.frame_duration_us(),
            key_frame,
        })
    }
}

/// Timing assigned to an audio block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioStamp {
    pub timestamp_us: u64,
    /// Leading frames captured before the anchor, to be cut from the block
    pub trim_frames: usize,
}

/// Timestamps for converted audio blocks.
///
/// Each block is placed on the session clock where it was captured: right
/// after the previous block, or later when the wall clock shows a gap. Blocks
/// captured before the first video frame are dropped and a block straddling
/// it is trimmed, so audio starts with the picture.
pub struct AudioClock {
    mode: TimestampMode,
    sample_rate: u32,
    clock: SessionClock,
    anchor: SyncAnchor,
    /// Session time just past the last block seen
    next_start_us: Option<u64>,
    /// Frames since the anchor, for the sample-count clock
    position: Option<u64>,
    /// Frames seen so far, including frames lost to overflow
    frames: u64,
    last_timestamp_us: Option<u64>,
}

impl AudioClock {
    pub fn new(
        mode: TimestampMode,
        sample_rate: u32,
        clock: SessionClock,
        anchor: SyncAnchor,
    ) -> Self {
        Self {
            mode,
            sample_rate: sample_rate.max(1),
            clock,
            anchor,
            next_start_us: None,
            position: None,
            frames: 0,
            last_timestamp_us: None,
        }
    }

    fn frames_to_us(&self, frames: u64) -> u64 {
        frames * 1_000_000 / self.sample_rate as u64
    }

    fn us_to_frames(&self, us: u64) -> u64 {
        us * self.sample_rate as u64 / 1_000_000
    }

    /// Timing for a block of `frames` samples per channel that has just arrived.
    ///
    /// `skipped_frames` are frames lost before this block; they advance the
    /// clock so later audio stays aligned. Returns `None` when the block lies
    /// before the anchor or its timestamp would not advance.
    pub fn stamp(&mut self, frames: usize, skipped_frames: u64) -> Option<AudioStamp> {
        self.frames += skipped_frames + frames as u64;
        let duration_us = self.frames_to_us(frames as u64);
        let skipped_us = self.frames_to_us(skipped_frames);

        // The block ends about now; queued blocks continue where the last one ended
        let wall_start_us = self.clock.elapsed_us().saturating_sub(duration_us);
        let start_us = match self.next_start_us {
            Some(next) => (next + skipped_us).max(wall_start_us),
            None => wall_start_us,
        };
        self.next_start_us = Some(start_us + duration_us);

        let Some(anchor_us) = self.anchor.get() else {
            tracing::trace!(
                "Dropping audio block at {}us before the first video frame",
                start_us
            );
            return None;
        };
        if start_us + duration_us <= anchor_us {
            tracing::trace!("Dropping audio block ending before anchor {}us", anchor_us);
            return None;
        }
        let trim_frames =
            (self.us_to_frames(anchor_us.saturating_sub(start_us)) as usize).min(frames);
        if trim_frames == frames {
            return None;
        }

        let candidate_us = match self.mode {
            TimestampMode::ConstantFrameRate => {
                let position = match self.position {
                    Some(position) => position + skipped_frames,
                    None => self.us_to_frames(start_us.saturating_sub(anchor_us)),
                };
                self.position = Some(position + (frames - trim_frames) as u64);
                self.frames_to_us(position)
            }
            TimestampMode::WallClock => start_us.max(anchor_us) - anchor_us,
        };

        if let Some(previous) = self.last_timestamp_us {
            if candidate_us <= previous {
                tracing::trace!(
                    "Dropping audio block at {}us (previous {}us)",
                    candidate_us,
                    previous
                );
                return None;
            }
        }
        self.last_timestamp_us = Some(candidate_us);
        Some(AudioStamp {
            timestamp_us: candidate_us,
            trim_frames,
        })
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}
