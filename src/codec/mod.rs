//! Encoder pair
//!
//! Backend-neutral encoder traits, the FFmpeg subprocess backend and the
//! bitstream helpers it needs.

pub mod bitstream;
pub mod ffmpeg;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use ffmpeg::{FfmpegAudioEncoder, FfmpegEncoderFactory, FfmpegVideoEncoder};
pub use traits::{
    AudioBuffer, AudioCodec, AudioEncoder, AudioEncoderConfig, ChunkCallback, EncodedChunk,
    EncoderError, EncoderFactory, EncoderState, VideoCodec, VideoEncoder, VideoEncoderConfig,
};
