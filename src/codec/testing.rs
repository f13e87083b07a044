//! Scripted encoders for tests
//!
//! Record what they receive and emit small fake chunks synchronously.

use super::traits::{
    AudioBuffer, AudioEncoder, AudioEncoderConfig, ChunkCallback, EncodedChunk, EncoderError,
    EncoderFactory, EncoderState, VideoEncoder, VideoEncoderConfig,
};
use crate::capture::VideoFrame;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

pub const FAKE_AVCC: [u8; 6] = [1, 0x64, 0x00, 0x28, 0xFF, 0xE1];
pub const FAKE_ASC: [u8; 2] = [0x11, 0x88];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmittedFrame {
    pub timestamp_us: u64,
    pub key_frame: bool,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Default)]
pub struct EncoderLog {
    pub video_config: Option<VideoEncoderConfig>,
    pub audio_config: Option<AudioEncoderConfig>,
    pub frames: Vec<SubmittedFrame>,
    /// (timestamp, frames) per audio buffer
    pub audio: Vec<(u64, usize)>,
    pub video_flushes: usize,
    /// Video encode calls that arrived after the first flush
    pub encodes_after_flush: usize,
    pub audio_flushes: usize,
    pub video_closes: usize,
    pub audio_closes: usize,
}

/// Fake backend with switchable failure points
#[derive(Clone, Default)]
pub struct ScriptedEncoderFactory {
    pub unsupported: bool,
    pub reject_video: bool,
    pub reject_audio: bool,
    /// Zero-based encode call that fails
    pub fail_video_encode_at: Option<usize>,
    pub fail_video_flush: bool,
    pub log: Arc<Mutex<EncoderLog>>,
}

impl ScriptedEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<SubmittedFrame> {
        self.log.lock().frames.clone()
    }
}

#[async_trait]
impl EncoderFactory for ScriptedEncoderFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn probe(&self) -> Result<(), EncoderError> {
        if self.unsupported {
            return Err(EncoderError::Unsupported("scripted backend disabled".to_string()));
        }
        Ok(())
    }

    fn video_encoder(&self, output: ChunkCallback) -> Result<Box<dyn VideoEncoder>, EncoderError> {
        Ok(Box::new(ScriptedVideoEncoder {
            script: self.clone(),
            output,
            calls: 0,
            emitted: 0,
            state: EncoderState::Unconfigured,
        }))
    }

    fn audio_encoder(&self, output: ChunkCallback) -> Result<Box<dyn AudioEncoder>, EncoderError> {
        Ok(Box::new(ScriptedAudioEncoder {
            script: self.clone(),
            output,
            emitted: 0,
            state: EncoderState::Unconfigured,
        }))
    }
}

struct ScriptedVideoEncoder {
    script: ScriptedEncoderFactory,
    output: ChunkCallback,
    calls: usize,
    emitted: usize,
    state: EncoderState,
}

impl VideoEncoder for ScriptedVideoEncoder {
    fn configure(&mut self, config: &VideoEncoderConfig) -> Result<(), EncoderError> {
        config.validate()?;
        if self.script.reject_video {
            return Err(EncoderError::Configuration("scripted rejection".to_string()));
        }
        self.script.log.lock().video_config = Some(config.clone());
        self.state = EncoderState::Configured;
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame, key_frame: bool) -> Result<(), EncoderError> {
        {
            let mut log = self.script.log.lock();
            if log.video_flushes > 0 {
                log.encodes_after_flush += 1;
            }
        }
        if self.state != EncoderState::Configured {
            return Err(EncoderError::Closed);
        }
        let call = self.calls;
        self.calls += 1;
        if self.script.fail_video_encode_at == Some(call) {
            return Err(EncoderError::Encode("scripted encode failure".to_string()));
        }

        self.script.log.lock().frames.push(SubmittedFrame {
            timestamp_us: frame.timestamp_us,
            key_frame,
            width: frame.picture.width,
            height: frame.picture.height,
        });

        let nal_header = if key_frame { 0x65 } else { 0x41 };
        (self.output)(EncodedChunk {
            data: vec![0, 0, 0, 2, nal_header, call as u8],
            timestamp_us: frame.timestamp_us,
            duration_us: frame.duration_us,
            is_key: key_frame,
            decoder_config: (self.emitted == 0).then(|| FAKE_AVCC.to_vec()),
        });
        self.emitted += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EncoderError> {
        self.script.log.lock().video_flushes += 1;
        if self.script.fail_video_flush {
            return Err(EncoderError::Backend("scripted flush failure".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.state != EncoderState::Closed {
            self.script.log.lock().video_closes += 1;
            self.state = EncoderState::Closed;
        }
    }

    fn state(&self) -> EncoderState {
        self.state
    }
}

struct ScriptedAudioEncoder {
    script: ScriptedEncoderFactory,
    output: ChunkCallback,
    emitted: usize,
    state: EncoderState,
}

impl AudioEncoder for ScriptedAudioEncoder {
    fn configure(&mut self, config: &AudioEncoderConfig) -> Result<(), EncoderError> {
        config.validate()?;
        if self.script.reject_audio {
            return Err(EncoderError::Configuration("scripted rejection".to_string()));
        }
        self.script.log.lock().audio_config = Some(config.clone());
        self.state = EncoderState::Configured;
        Ok(())
    }

    fn encode(&mut self, buffer: AudioBuffer) -> Result<(), EncoderError> {
        if self.state != EncoderState::Configured {
            return Err(EncoderError::Closed);
        }
        self.script
            .log
            .lock()
            .audio
            .push((buffer.timestamp_us, buffer.frames()));

        (self.output)(EncodedChunk {
            data: vec![0x21, 0x10, self.emitted as u8],
            timestamp_us: buffer.timestamp_us,
            duration_us: buffer.duration_us(),
            is_key: true,
            decoder_config: (self.emitted == 0).then(|| FAKE_ASC.to_vec()),
        });
        self.emitted += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EncoderError> {
        self.script.log.lock().audio_flushes += 1;
        Ok(())
    }

    fn close(&mut self) {
        if self.state != EncoderState::Closed {
            self.script.log.lock().audio_closes += 1;
            self.state = EncoderState::Closed;
        }
    }

    fn state(&self) -> EncoderState {
        self.state
    }
}
