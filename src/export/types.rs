//! Transcode types and configuration
//!
//! This module defines the conversion recipes, progress reporting and error
//! handling for the fallback transcode pipeline.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// A named FFmpeg conversion recipe producing MP4
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeRecipe {
    /// Name used in logs
    pub name: String,
    /// FFmpeg video encoder the recipe needs
    pub video_encoder: String,
    /// Encoder-specific video options
    pub video_args: Vec<String>,
    /// Constant output frame rate
    pub frame_rate: u32,
    /// AAC bitrate, FFmpeg notation
    pub audio_bitrate: String,
}

impl TranscodeRecipe {
    /// H.264 tuned for speed with reasonable quality
    pub fn primary(frame_rate: u32) -> Self {
        Self {
            name: "h264".to_string(),
            video_encoder: "libx264".to_string(),
            video_args: ["-preset", "ultrafast", "-crf", "26", "-pix_fmt", "yuv420p"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            frame_rate,
            audio_bitrate: "128k".to_string(),
        }
    }

    /// MPEG-4 Part 2, available in every FFmpeg build
    pub fn secondary(frame_rate: u32) -> Self {
        Self {
            name: "mpeg4".to_string(),
            video_encoder: "mpeg4".to_string(),
            video_args: vec!["-q:v".to_string(), "6".to_string()],
            frame_rate,
            audio_bitrate: "128k".to_string(),
        }
    }

    /// Full FFmpeg argument list
    pub fn args(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut args: Vec<String> = [
            "-hide_banner",
            "-y",
            // Intermediate recordings often carry broken or missing timestamps
            "-fflags",
            "+genpts+igndts",
            "-avoid_negative_ts",
            "make_zero",
            "-i",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(input.to_string_lossy().to_string());

        args.extend([
            "-r".to_string(),
            self.frame_rate.to_string(),
            "-c:v".to_string(),
            self.video_encoder.clone(),
        ]);
        args.extend(self.video_args.iter().cloned());

        args.extend(
            [
                "-c:a",
                "aac",
                "-b:a",
                &self.audio_bitrate,
                "-af",
                "aresample=async=1",
                "-fps_mode",
                "cfr",
                "-movflags",
                "+faststart",
                "-progress",
                "pipe:1",
                "-nostats",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(output.to_string_lossy().to_string());
        args
    }
}

/// Conversion progress stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum TranscodeStage {
    /// Loading the toolchain and staging the input
    Preparing,
    /// Running a recipe
    Converting { recipe: String },
    /// Reading back the output
    Finalizing,
    /// Conversion completed successfully
    Done,
}

/// Conversion progress information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeProgress {
    /// Progress percentage (0.0 to 100.0)
    pub percent: f32,
    /// Current stage
    pub stage: TranscodeStage,
}

impl TranscodeProgress {
    pub fn preparing() -> Self {
        Self {
            percent: 0.0,
            stage: TranscodeStage::Preparing,
        }
    }

    pub fn converting(recipe: &str, percent: f32) -> Self {
        Self {
            percent: percent.clamp(0.0, 100.0),
            stage: TranscodeStage::Converting {
                recipe: recipe.to_string(),
            },
        }
    }

    /// Percentage from processed vs total media time
    pub fn from_media_time(recipe: &str, processed_us: u64, total_us: u64) -> Self {
        let percent = if total_us > 0 {
            processed_us as f32 / total_us as f32 * 100.0
        } else {
            0.0
        };
        Self::converting(recipe, percent)
    }

    pub fn finalizing() -> Self {
        Self {
            percent: 100.0,
            stage: TranscodeStage::Finalizing,
        }
    }

    pub fn done() -> Self {
        Self {
            percent: 100.0,
            stage: TranscodeStage::Done,
        }
    }

    /// Short status text
    pub fn message(&self) -> String {
        match &self.stage {
            TranscodeStage::Preparing => "Preparing".to_string(),
            TranscodeStage::Converting { recipe } => {
                format!("Converting ({}) {:.0}%", recipe, self.percent)
            }
            TranscodeStage::Finalizing => "Finalizing".to_string(),
            TranscodeStage::Done => "Done".to_string(),
        }
    }
}

/// Transcode errors
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FFmpeg toolchain unavailable: {0}")]
    Toolchain(String),

    #[error("FFmpeg error: {0}")]
    Ffmpeg(String),

    #[error("Encoder {0} not available in toolchain")]
    CodecUnavailable(String),

    #[error("Conversion produced no output")]
    EmptyOutput,

    #[error("No recipe configured")]
    NoRecipes,

    #[error("Conversion timed out after {0:?}")]
    Timeout(Duration),

    #[error("Intermediate recording failed: {0}")]
    Recording(String),
}
