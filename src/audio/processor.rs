//! Audio processing context
//!
//! Pulls float blocks from a live [`AudioFeed`], converts them to 16-bit and
//! hands fixed-size blocks to the encoder side through a bounded channel.
//! Blocks move through the channel by value; nothing is copied on the way.

use super::convert::Rechunker;
use crate::capture::AudioFeed;
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Where float → fixed-point conversion runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AudioProcessingMode {
    /// A dedicated real-time thread converts and forwards blocks
    Dedicated,
    /// Conversion happens on the consumer's thread as blocks are received
    Inline,
}

/// A converted block of interleaved 16-bit samples
#[derive(Debug)]
pub struct SampleBlock {
    pub samples: Vec<i16>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Frames dropped on channel overflow just before this block
    pub skipped_frames: u64,
}

impl SampleBlock {
    /// Samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Result of polling for the next block
#[derive(Debug)]
pub enum BlockPoll {
    Block(SampleBlock),
    /// Nothing arrived within the timeout
    Empty,
    /// The producer side is gone and every block has been delivered
    Closed,
}

/// Receiving end handed to the encoder side
pub enum BlockReceiver {
    Converted(Receiver<SampleBlock>),
    Inline(InlineConverter),
}

impl BlockReceiver {
    /// Wait up to `timeout` for the next block
    pub fn poll(&mut self, timeout: Duration) -> BlockPoll {
        match self {
            BlockReceiver::Converted(rx) => match rx.recv_timeout(timeout) {
                Ok(block) => BlockPoll::Block(block),
                Err(RecvTimeoutError::Timeout) => BlockPoll::Empty,
                Err(RecvTimeoutError::Disconnected) => BlockPoll::Closed,
            },
            BlockReceiver::Inline(inline) => inline.poll(timeout),
        }
    }
}

/// Converts on the caller's thread
pub struct InlineConverter {
    feed: Receiver<Vec<f32>>,
    /// Disconnected once the pipeline is detached
    stop: Receiver<()>,
    rechunker: Rechunker,
    ready: VecDeque<Vec<i16>>,
    channels: u16,
    sample_rate: u32,
    finished: bool,
}

impl InlineConverter {
    fn block(&self, samples: Vec<i16>) -> SampleBlock {
        SampleBlock {
            samples,
            channels: self.channels,
            sample_rate: self.sample_rate,
            skipped_frames: 0,
        }
    }

    fn poll(&mut self, timeout: Duration) -> BlockPoll {
        if let Some(samples) = self.ready.pop_front() {
            return BlockPoll::Block(self.block(samples));
        }
        if self.finished {
            return BlockPoll::Closed;
        }

        let received = select! {
            recv(self.feed) -> input => Some(input.ok()),
            recv(self.stop) -> _ => Some(None),
            default(timeout) => None,
        };
        let Some(received) = received else {
            return BlockPoll::Empty;
        };

        match received {
            Some(input) => {
                self.ready.extend(self.rechunker.push(&input));
                match self.ready.pop_front() {
                    Some(samples) => BlockPoll::Block(self.block(samples)),
                    None => BlockPoll::Empty,
                }
            }
            None => {
                // Detached or ended: whatever the feed already delivered still counts
                while let Ok(input) = self.feed.try_recv() {
                    self.ready.extend(self.rechunker.push(&input));
                }
                self.finished = true;
                self.ready.extend(self.rechunker.finish());
                match self.ready.pop_front() {
                    Some(samples) => BlockPoll::Block(self.block(samples)),
                    None => BlockPoll::Closed,
                }
            }
        }
    }
}

/// Settings for the processing context
#[derive(Debug, Clone, Copy)]
pub struct AudioPipelineConfig {
    pub mode: AudioProcessingMode,
    pub block_frames: usize,
    pub channel_capacity: usize,
}

/// A connected audio processing graph
pub struct AudioPipeline {
    /// Dropped to detach from the feed
    stop: Option<Sender<()>>,
    dropped_frames: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
    sample_rate: u32,
    channels: u16,
}

impl AudioPipeline {
    /// Attach to `feed` and start converting.
    ///
    /// Returns the pipeline handle and the receiving end for the encoder side.
    pub fn connect(
        feed: AudioFeed,
        config: AudioPipelineConfig,
    ) -> std::io::Result<(AudioPipeline, BlockReceiver)> {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let dropped_frames = Arc::new(AtomicU64::new(0));
        let AudioFeed {
            sample_rate,
            channels,
            blocks,
        } = feed;

        let (worker, receiver) = match config.mode {
            AudioProcessingMode::Dedicated => {
                let (tx, rx) = crossbeam_channel::bounded(config.channel_capacity.max(1));
                let worker = Worklet {
                    feed: blocks,
                    stop: stopped,
                    output: tx,
                    rechunker: Rechunker::new(config.block_frames, channels),
                    channels,
                    sample_rate,
                    dropped_frames: dropped_frames.clone(),
                };
                let handle = std::thread::Builder::new()
                    .name("audio-worklet".into())
                    .spawn(move || worker.run())?;
                (Some(handle), BlockReceiver::Converted(rx))
            }
            AudioProcessingMode::Inline => {
                let inline = InlineConverter {
                    feed: blocks,
                    stop: stopped,
                    rechunker: Rechunker::new(config.block_frames, channels),
                    ready: VecDeque::new(),
                    channels,
                    sample_rate,
                    finished: false,
                };
                (None, BlockReceiver::Inline(inline))
            }
        };

        tracing::info!(
            "Audio pipeline connected: {:?}, {} Hz x {} ch, {}-frame blocks",
            config.mode,
            sample_rate,
            channels,
            config.block_frames
        );

        Ok((
            AudioPipeline {
                stop: Some(stop),
                dropped_frames,
                worker,
                sample_rate,
                channels,
            },
            receiver,
        ))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Frames lost to channel overflow so far
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Detach from the feed. The receiver drains what is queued, then closes.
    pub fn disconnect(&mut self) {
        drop(self.stop.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Audio worklet thread panicked");
            }
        }
        tracing::debug!(
            "Audio pipeline disconnected ({} frames dropped)",
            self.dropped_frames()
        );
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        if self.stop.is_some() || self.worker.is_some() {
            self.disconnect();
        }
    }
}

/// Dedicated conversion thread
struct Worklet {
    feed: Receiver<Vec<f32>>,
    stop: Receiver<()>,
    output: Sender<SampleBlock>,
    rechunker: Rechunker,
    channels: u16,
    sample_rate: u32,
    dropped_frames: Arc<AtomicU64>,
}

impl Worklet {
    fn run(mut self) {
        let mut skipped = 0u64;
        loop {
            let input = select! {
                recv(self.feed) -> input => input.ok(),
                recv(self.stop) -> _ => None,
            };
            let Some(input) = input else {
                break;
            };

            for samples in self.rechunker.push(&input) {
                if !self.forward(samples, &mut skipped) {
                    return;
                }
            }
        }

        // Whatever was delivered before the disconnect still gets through
        while let Ok(input) = self.feed.try_recv() {
            for samples in self.rechunker.push(&input) {
                if !self.forward(samples, &mut skipped) {
                    return;
                }
            }
        }

        if let Some(samples) = self.rechunker.finish() {
            let _ = self.forward(samples, &mut skipped);
        }
    }

    /// Returns false once the receiving side is gone
    fn forward(&self, samples: Vec<i16>, skipped: &mut u64) -> bool {
        let frames = (samples.len() / self.channels.max(1) as usize) as u64;
        let block = SampleBlock {
            samples,
            channels: self.channels,
            sample_rate: self.sample_rate,
            skipped_frames: *skipped,
        };

        match self.output.try_send(block) {
            Ok(()) => {
                *skipped = 0;
                true
            }
            Err(TrySendError::Full(_)) => {
                *skipped += frames;
                self.dropped_frames.fetch_add(frames, Ordering::Relaxed);
                tracing::warn!("Audio channel full, dropped {} frames", frames);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
