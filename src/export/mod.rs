//! Fallback transcode module
//!
//! When direct MP4 capture is unavailable, recordings go through an
//! intermediate Matroska file and are converted to MP4 with FFmpeg.

pub mod ffmpeg;
pub mod intermediate;
pub mod pipeline;
pub mod toolchain;
pub mod types;

pub use ffmpeg::{FfmpegTranscodeBackend, TranscodeBackend};
pub use intermediate::FfmpegIntermediateRecorder;
pub use pipeline::TranscodePipeline;
pub use toolchain::{FfmpegProbe, LoaderState, Toolchain, ToolchainLoader, ToolchainProbe};
pub use types::{TranscodeError, TranscodeProgress, TranscodeRecipe, TranscodeStage};
