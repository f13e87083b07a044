//! Intermediate recorder
//!
//! Fallback capture path used when the direct MP4 engine cannot start.
//! Pictures are piped to FFmpeg as raw RGBA and stored as MJPEG in Matroska;
//! audio is written as raw 16-bit PCM next to it. On stop both are joined into
//! one Matroska file held in memory, ready for the transcode pipeline.

use crate::audio::{AudioPipeline, AudioPipelineConfig, BlockPoll, BlockReceiver};
use crate::capture::{MediaSource, Picture};
use crate::config::CaptureSettings;
use crate::export::toolchain::{Toolchain, ToolchainLoader};
use crate::export::types::TranscodeError;
use crate::output::{ContainerFormat, MediaArtifact};
use crate::recorder::state::{RecordingState, StartOptions};
use crate::recorder::strategy::CaptureStrategy;
use crate::recorder::timeline::{
    FrameDecision, SessionClock, SyncAnchor, SystemClock, TimelineConfig, TimestampMode,
    VideoTimeline,
};
use crate::utils::error::{CaptureError, CaptureResult};
use crate::utils::process::StderrTail;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tempfile::TempDir;

/// Encoder the intermediate video needs
pub const INTERMEDIATE_VIDEO_ENCODER: &str = "mjpeg";

const AUDIO_POLL: Duration = Duration::from_millis(20);

/// FFmpeg arguments for the raw RGBA → MJPEG/Matroska video process
pub fn video_args(width: u32, height: u32, frame_rate: u32, output: &Path) -> Vec<String> {
    let size = format!("{}x{}", width, height);
    let rate = frame_rate.to_string();
    let output = output.to_string_lossy().to_string();
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-f",
        "rawvideo",
        "-pix_fmt",
        "rgba",
        "-s",
        size.as_str(),
        "-framerate",
        rate.as_str(),
        "-i",
        "pipe:0",
        "-c:v",
        INTERMEDIATE_VIDEO_ENCODER,
        "-q:v",
        "3",
        "-pix_fmt",
        "yuvj420p",
        "-f",
        "matroska",
        output.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// FFmpeg arguments joining the video file with raw PCM audio
pub fn join_args(
    video: &Path,
    audio: &Path,
    sample_rate: u32,
    channels: u16,
    output: &Path,
) -> Vec<String> {
    let rate = sample_rate.to_string();
    let channels = channels.to_string();
    let video = video.to_string_lossy().to_string();
    let audio = audio.to_string_lossy().to_string();
    let output = output.to_string_lossy().to_string();
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-y",
        "-i",
        video.as_str(),
        "-f",
        "s16le",
        "-ar",
        rate.as_str(),
        "-ac",
        channels.as_str(),
        "-i",
        audio.as_str(),
        "-map",
        "0:v",
        "-map",
        "1:a",
        "-c:v",
        "copy",
        "-c:a",
        "pcm_s16le",
        "-f",
        "matroska",
        output.as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// FFmpeg-backed fallback recorder producing Matroska
pub struct FfmpegIntermediateRecorder {
    loader: Arc<ToolchainLoader>,
    settings: CaptureSettings,
    state: Arc<RwLock<RecordingState>>,
    session: Mutex<Option<IntermediateSession>>,
}

struct IntermediateSession {
    dir: TempDir,
    toolchain: Arc<Toolchain>,
    timeline: VideoTimeline,
    width: u32,
    height: u32,
    process: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<StderrTail>,
    video_path: PathBuf,
    audio: Option<PcmCapture>,
}

struct PcmCapture {
    pipeline: AudioPipeline,
    writer: JoinHandle<std::io::Result<u64>>,
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
}

impl FfmpegIntermediateRecorder {
    pub fn new(loader: Arc<ToolchainLoader>, settings: CaptureSettings) -> Self {
        Self {
            loader,
            settings,
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            session: Mutex::new(None),
        }
    }

    async fn open_session(
        &self,
        options: &StartOptions,
        source: Option<Arc<dyn MediaSource>>,
    ) -> CaptureResult<IntermediateSession> {
        let toolchain = self
            .loader
            .load()
            .await
            .map_err(|e| CaptureError::UnsupportedCapability(e.to_string()))?;
        if !toolchain.has_encoder(INTERMEDIATE_VIDEO_ENCODER) {
            return Err(CaptureError::UnsupportedCapability(format!(
                "FFmpeg {} has no {} encoder",
                toolchain.version, INTERMEDIATE_VIDEO_ENCODER
            )));
        }

        let (width, height) = options.even_dimensions();
        if width == 0 || height == 0 {
            return Err(CaptureError::EncoderConfigurationRejected(format!(
                "invalid resolution {}x{}",
                options.width, options.height
            )));
        }
        let frame_rate = options.effective_frame_rate();

        let dir = tempfile::Builder::new().prefix("easycord-").tempdir()?;
        let video_path = dir.path().join("video.mkv");

        let clock = SessionClock::start(Arc::new(SystemClock::default()));
        let audio = match source.as_ref().filter(|s| s.has_audio()) {
            Some(source) => Some(self.open_audio(source.as_ref(), dir.path())?),
            None => None,
        };

        let mut process = Command::new(&toolchain.binary)
            .args(video_args(width, height, frame_rate, &video_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                CaptureError::UnsupportedCapability(format!("Failed to start FFmpeg: {}", e))
            })?;
        let stdin = process.stdin.take();
        let stderr = StderrTail::spawn(process.stderr.take(), "intermediate")?;

        tracing::info!(
            "Intermediate recorder started: {}x{} @ {}fps into {:?}",
            width,
            height,
            frame_rate,
            dir.path()
        );

        Ok(IntermediateSession {
            dir,
            toolchain,
            timeline: VideoTimeline::new(
                TimelineConfig {
                    frame_rate,
                    warmup_frames: 0,
                    keyframe_interval_secs: self.settings.keyframe_interval_secs,
                    mode: TimestampMode::ConstantFrameRate,
                },
                clock,
                SyncAnchor::default(),
            ),
            width,
            height,
            process,
            stdin,
            stderr: Some(stderr),
            video_path,
            audio,
        })
    }

    fn open_audio(&self, source: &dyn MediaSource, dir: &Path) -> CaptureResult<PcmCapture> {
        let feed = source
            .open_audio()
            .map_err(|e| CaptureError::AudioSetup(e.to_string()))?;
        let sample_rate = feed.sample_rate;
        let channels = feed.channels;
        let path = dir.join("audio.pcm");
        let file = File::create(&path)?;

        let (pipeline, receiver) = AudioPipeline::connect(
            feed,
            AudioPipelineConfig {
                mode: self.settings.audio_processing,
                block_frames: self.settings.audio_block_frames,
                channel_capacity: self.settings.audio_channel_capacity,
            },
        )
        .map_err(|e| CaptureError::AudioSetup(e.to_string()))?;

        let state = self.state.clone();
        let writer = std::thread::Builder::new()
            .name("pcm-writer".into())
            .spawn(move || write_pcm(receiver, BufWriter::new(file), state))
            .map_err(|e| CaptureError::AudioSetup(e.to_string()))?;

        Ok(PcmCapture {
            pipeline,
            writer,
            path,
            sample_rate,
            channels,
        })
    }
}

/// Append blocks as little-endian PCM. Returns frames written.
fn write_pcm(
    mut receiver: BlockReceiver,
    mut out: BufWriter<File>,
    state: Arc<RwLock<RecordingState>>,
) -> std::io::Result<u64> {
    let mut frames = 0u64;
    loop {
        match receiver.poll(AUDIO_POLL) {
            BlockPoll::Block(block) => {
                if !state.read().is_capturing() {
                    continue;
                }
                frames += block.frames() as u64;
                let bytes: Vec<u8> = block.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
                out.write_all(&bytes)?;
            }
            BlockPoll::Empty => {}
            BlockPoll::Closed => break,
        }
    }
    out.flush()?;
    Ok(frames)
}

impl IntermediateSession {
    fn finish(mut self) -> Result<MediaArtifact, TranscodeError> {
        drop(self.stdin.take());
        let status = self
            .process
            .wait()
            .map_err(|e| TranscodeError::Recording(format!("FFmpeg wait failed: {}", e)))?;
        let stderr = self.stderr.take().map(StderrTail::collect).unwrap_or_default();
        if !status.success() {
            return Err(TranscodeError::Recording(format!(
                "FFmpeg video process exited with {}: {}",
                status, stderr
            )));
        }

        let mut result_path = self.video_path.clone();
        if let Some(PcmCapture {
            mut pipeline,
            writer,
            path,
            sample_rate,
            channels,
        }) = self.audio.take()
        {
            pipeline.disconnect();
            let frames = match writer.join() {
                Ok(Ok(frames)) => frames,
                Ok(Err(e)) => {
                    tracing::error!("Writing intermediate audio failed: {}", e);
                    0
                }
                Err(_) => {
                    tracing::error!("PCM writer thread panicked");
                    0
                }
            };

            if frames > 0 {
                let joined = self.dir.path().join("recording.mkv");
                let output = Command::new(&self.toolchain.binary)
                    .args(join_args(&self.video_path, &path, sample_rate, channels, &joined))
                    .stdin(Stdio::null())
                    .output()
                    .map_err(|e| {
                        TranscodeError::Recording(format!("Failed to start FFmpeg: {}", e))
                    })?;
                if output.status.success() {
                    result_path = joined;
                } else {
                    // Keep the picture even if the audio cannot be attached
                    tracing::error!(
                        "Joining intermediate audio failed: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
            }
        }

        let bytes = std::fs::read(&result_path)?;
        if bytes.is_empty() {
            return Err(TranscodeError::EmptyOutput);
        }
        tracing::info!(
            "Intermediate recording finished: {} frames, {} bytes",
            self.timeline.accepted(),
            bytes.len()
        );
        Ok(MediaArtifact::new(bytes, ContainerFormat::Matroska))
    }
}

#[async_trait]
impl CaptureStrategy for FfmpegIntermediateRecorder {
    fn name(&self) -> &str {
        "ffmpeg-intermediate"
    }

    async fn try_start(
        &self,
        options: &StartOptions,
        source: Option<Arc<dyn MediaSource>>,
    ) -> CaptureResult<()> {
        {
            let mut state = self.state.write();
            if *state != RecordingState::Idle {
                return Err(CaptureError::AlreadyRecording);
            }
            *state = RecordingState::Starting;
        }

        match self.open_session(options, source).await {
            Ok(session) => {
                *self.session.lock() = Some(session);
                *self.state.write() = RecordingState::Recording;
                Ok(())
            }
            Err(e) => {
                *self.state.write() = RecordingState::Idle;
                Err(e)
            }
        }
    }

    fn add_frame(&self, picture: Picture) {
        if !self.state.read().is_capturing() {
            return;
        }
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return;
        };
        if !picture.is_well_formed() || picture.width < session.width || picture.height < session.height
        {
            tracing::warn!("Dropping malformed {}x{} picture", picture.width, picture.height);
            return;
        }
        if !matches!(session.timeline.next_frame(), FrameDecision::Accept(_)) {
            return;
        }

        let picture = picture.cropped(session.width, session.height);
        if let Some(stdin) = session.stdin.as_mut() {
            if let Err(e) = stdin.write_all(&picture.rgba) {
                tracing::warn!("Writing frame to FFmpeg failed: {}", e);
            }
        }
    }

    fn pause(&self) -> CaptureResult<()> {
        let mut state = self.state.write();
        if *state != RecordingState::Recording {
            return Err(CaptureError::NotRecording);
        }
        if let Some(session) = self.session.lock().as_ref() {
            session.timeline.clock().pause();
        }
        *state = RecordingState::Paused;
        Ok(())
    }

    fn resume(&self) -> CaptureResult<()> {
        let mut state = self.state.write();
        if *state != RecordingState::Paused {
            return Err(CaptureError::NotRecording);
        }
        if let Some(session) = self.session.lock().as_ref() {
            session.timeline.clock().resume();
        }
        *state = RecordingState::Recording;
        Ok(())
    }

    async fn stop(&self) -> CaptureResult<MediaArtifact> {
        {
            let mut state = self.state.write();
            if !matches!(*state, RecordingState::Recording | RecordingState::Paused) {
                return Err(CaptureError::NotRecording);
            }
            *state = RecordingState::Stopping;
        }

        let session = self.session.lock().take();
        let result = match session {
            Some(session) => match tokio::task::spawn_blocking(move || session.finish()).await {
                Ok(result) => result.map_err(CaptureError::from),
                Err(e) => Err(CaptureError::TranscodeFailure(format!(
                    "intermediate finish task failed: {}",
                    e
                ))),
            },
            None => Err(CaptureError::NotRecording),
        };

        *self.state.write() = RecordingState::Idle;
        result
    }

    fn state(&self) -> RecordingState {
        *self.state.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::toolchain::tests::CountingProbe;

    fn recorder(encoders: &[&'static str]) -> FfmpegIntermediateRecorder {
        let loader = ToolchainLoader::with_probe(None, Arc::new(CountingProbe::with_encoders(encoders)));
        FfmpegIntermediateRecorder::new(Arc::new(loader), CaptureSettings::default())
    }

    #[test]
    fn test_video_args() {
        let args = video_args(1278, 720, 30, Path::new("/tmp/v.mkv")).join(" ");
        assert!(args.contains("-f rawvideo -pix_fmt rgba -s 1278x720 -framerate 30 -i pipe:0"));
        assert!(args.contains("-c:v mjpeg"));
        assert!(args.ends_with("-f matroska /tmp/v.mkv"));
    }

    #[test]
    fn test_join_args() {
        let args = join_args(
            Path::new("v.mkv"),
            Path::new("a.pcm"),
            48_000,
            2,
            Path::new("out.mkv"),
        )
        .join(" ");
        assert!(args.contains("-f s16le -ar 48000 -ac 2 -i a.pcm"));
        assert!(args.contains("-c:v copy -c:a pcm_s16le"));
    }

    #[tokio::test]
    async fn test_missing_mjpeg_is_unsupported() {
        let recorder = recorder(&["libx264", "aac"]);
        let error = recorder
            .try_start(&StartOptions::new(64, 48), None)
            .await
            .unwrap_err();
        assert!(matches!(error, CaptureError::UnsupportedCapability(_)));
        assert_eq!(CaptureStrategy::state(&recorder), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_stop_without_session() {
        let recorder = recorder(&["mjpeg"]);
        assert!(matches!(
            recorder.stop().await,
            Err(CaptureError::NotRecording)
        ));
        recorder.add_frame(Picture::new(2, 2, vec![0; 16]));
    }
}
