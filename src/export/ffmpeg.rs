//! FFmpeg transcode backend
//!
//! Runs one recipe as a child process and turns its `-progress` output into
//! percentage updates.

use crate::export::toolchain::Toolchain;
use crate::export::types::{TranscodeError, TranscodeProgress, TranscodeRecipe};
use crate::utils::process::STDERR_TAIL;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

/// Progress sink passed to a backend run
pub type ProgressFn<'a> = &'a (dyn Fn(TranscodeProgress) + Send + Sync);

/// Runs a single conversion
#[async_trait]
pub trait TranscodeBackend: Send + Sync {
    async fn run(
        &self,
        toolchain: &Toolchain,
        recipe: &TranscodeRecipe,
        input: &Path,
        output: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), TranscodeError>;
}

/// Parse `Duration: HH:MM:SS.cc` from FFmpeg's input banner
pub fn parse_input_duration_us(stderr_line: &str) -> Option<u64> {
    let rest = stderr_line.trim_start().strip_prefix("Duration:")?;
    let stamp = rest.split(',').next()?.trim();
    parse_clock_us(stamp)
}

/// `HH:MM:SS.frac` to microseconds
fn parse_clock_us(stamp: &str) -> Option<u64> {
    let mut parts = stamp.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((hours * 3600 + minutes * 60) * 1_000_000 + (seconds * 1_000_000.0) as u64)
}

/// Value of an `out_time_us=` progress line. FFmpeg prints `N/A` before the first packet.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let value = line.strip_prefix("out_time_us=")?;
    value.trim().parse::<i64>().ok().map(|v| v.max(0) as u64)
}

/// Backend spawning the probed FFmpeg binary
pub struct FfmpegTranscodeBackend;

#[async_trait]
impl TranscodeBackend for FfmpegTranscodeBackend {
    async fn run(
        &self,
        toolchain: &Toolchain,
        recipe: &TranscodeRecipe,
        input: &Path,
        output: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<(), TranscodeError> {
        let args = recipe.args(input, output);
        tracing::debug!("FFmpeg transcode args: {:?}", args);

        let mut child = Command::new(&toolchain.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::Ffmpeg(format!("Failed to start FFmpeg: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TranscodeError::Ffmpeg("Failed to capture FFmpeg stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TranscodeError::Ffmpeg("Failed to capture FFmpeg stderr".to_string()))?;

        // The input banner carries the total duration; progress lines only carry elapsed time
        let (duration_tx, duration_rx) = tokio::sync::watch::channel(0u64);
        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(total) = parse_input_duration_us(&line) {
                    let _ = duration_tx.send(total);
                }
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(processed_us) = parse_progress_line(&line) {
                let total_us = *duration_rx.borrow();
                progress(TranscodeProgress::from_media_time(
                    &recipe.name,
                    processed_us,
                    total_us,
                ));
            }
        }

        let status = child.wait().await?;
        let tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(TranscodeError::Ffmpeg(format!(
                "{} recipe exited with {}: {}",
                recipe.name,
                status,
                tail.into_iter().collect::<Vec<_>>().join(" | ")
            )));
        }

        tracing::debug!(
            "Transcoded {}us of media with {}",
            *duration_rx.borrow(),
            recipe.name
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_input_duration() {
        let line = "  Duration: 00:01:02.50, start: 0.000000, bitrate: 1200 kb/s";
        assert_eq!(parse_input_duration_us(line), Some(62_500_000));
        assert_eq!(parse_input_duration_us("  Duration: N/A, bitrate: N/A"), None);
        assert_eq!(parse_input_duration_us("Stream #0:0: Video"), None);
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(parse_progress_line("out_time_us=1500000"), Some(1_500_000));
        assert_eq!(parse_progress_line("out_time_us=-23000"), Some(0));
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("frame=12"), None);
    }
}
