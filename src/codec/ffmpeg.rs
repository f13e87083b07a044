//! FFmpeg subprocess encoders
//!
//! Raw frames and samples are piped to an `ffmpeg` child on stdin. A reader
//! thread parses the elementary stream coming back on stdout and hands chunks
//! to the output callback in submission order.

use super::bitstream::{AccessUnit, AccessUnitAssembler, AdtsParser, AnnexBSplitter, AAC_FRAME_SAMPLES};
use super::traits::{
    AudioBuffer, AudioEncoder, AudioEncoderConfig, ChunkCallback, EncodedChunk, EncoderError,
    EncoderFactory, EncoderState, VideoEncoder, VideoEncoderConfig,
};
use crate::capture::VideoFrame;
use crate::export::{Toolchain, ToolchainLoader};
use crate::utils::process::StderrTail;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;

const H264_ENCODER: &str = "libx264";
const AAC_ENCODER: &str = "aac";
const READ_BUFFER: usize = 64 * 1024;

/// Encoder factory backed by the FFmpeg toolchain
pub struct FfmpegEncoderFactory {
    loader: Arc<ToolchainLoader>,
    toolchain: Mutex<Option<Arc<Toolchain>>>,
}

impl FfmpegEncoderFactory {
    pub fn new(loader: Arc<ToolchainLoader>) -> Self {
        Self {
            loader,
            toolchain: Mutex::new(None),
        }
    }

    fn toolchain(&self) -> Result<Arc<Toolchain>, EncoderError> {
        self.toolchain
            .lock()
            .clone()
            .ok_or_else(|| EncoderError::Unsupported("FFmpeg toolchain not probed".to_string()))
    }
}

#[async_trait]
impl EncoderFactory for FfmpegEncoderFactory {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn probe(&self) -> Result<(), EncoderError> {
        let toolchain = self
            .loader
            .load()
            .await
            .map_err(|e| EncoderError::Unsupported(e.to_string()))?;

        for encoder in [H264_ENCODER, AAC_ENCODER] {
            if !toolchain.has_encoder(encoder) {
                return Err(EncoderError::Unsupported(format!(
                    "FFmpeg {} has no {} encoder",
                    toolchain.version, encoder
                )));
            }
        }

        *self.toolchain.lock() = Some(toolchain);
        Ok(())
    }

    fn video_encoder(&self, output: ChunkCallback) -> Result<Box<dyn VideoEncoder>, EncoderError> {
        let toolchain = self.toolchain()?;
        Ok(Box::new(FfmpegVideoEncoder::new(&toolchain.binary, output)))
    }

    fn audio_encoder(&self, output: ChunkCallback) -> Result<Box<dyn AudioEncoder>, EncoderError> {
        let toolchain = self.toolchain()?;
        Ok(Box::new(FfmpegAudioEncoder::new(&toolchain.binary, output)))
    }
}

/// A running encoder child with its stdout reader thread
struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<JoinHandle<Result<u64, EncoderError>>>,
    stderr: Option<StderrTail>,
    label: &'static str,
}

impl EncoderProcess {
    fn spawn<F>(binary: &Path, args: &[String], label: &'static str, read: F) -> Result<Self, EncoderError>
    where
        F: FnOnce(ChildStdout) -> Result<u64, EncoderError> + Send + 'static,
    {
        tracing::info!("Starting FFmpeg {} encoder: {:?}", label, args);

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EncoderError::Unsupported(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Backend("Failed to capture FFmpeg stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncoderError::Backend("Failed to capture FFmpeg stdout".to_string()))?;

        let stderr = StderrTail::spawn(child.stderr.take(), label)?;

        let reader = std::thread::Builder::new()
            .name(format!("{}-reader", label))
            .spawn(move || read(stdout))?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            reader: Some(reader),
            stderr: Some(stderr),
            label,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<(), EncoderError> {
        let stdin = self.stdin.as_mut().ok_or(EncoderError::Closed)?;
        stdin
            .write_all(data)
            .map_err(|e| EncoderError::Encode(format!("Failed to write to FFmpeg: {}", e)))
    }

    /// Close stdin, wait for every output chunk and for the process to exit
    fn finish(mut self) -> Result<u64, EncoderError> {
        drop(self.stdin.take());

        let emitted = match self.reader.take().map(|r| r.join()) {
            Some(Ok(result)) => result?,
            Some(Err(_)) => return Err(EncoderError::Backend(format!("{} reader panicked", self.label))),
            None => 0,
        };

        let status = self.child.wait()?;
        let stderr = self.stderr.take().map(StderrTail::collect).unwrap_or_default();
        if !status.success() {
            return Err(EncoderError::Backend(format!(
                "FFmpeg {} encoder exited with {}: {}",
                self.label, status, stderr
            )));
        }

        tracing::info!("FFmpeg {} encoder finished: {} chunks", self.label, emitted);
        Ok(emitted)
    }

    fn kill(mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(stderr) = self.stderr.take() {
            let tail = stderr.collect();
            if !tail.is_empty() {
                tracing::debug!("FFmpeg {} encoder killed: {}", self.label, tail);
            }
        }
    }
}

/// A key frame requested where the fixed GOP schedule will not place an IDR
fn is_off_grid_key(key_frame: bool, position: u64, keyframe_interval: u32) -> bool {
    key_frame && position % keyframe_interval.max(1) as u64 != 0
}

fn read_loop<F>(mut stdout: ChildStdout, mut on_data: F) -> Result<(), EncoderError>
where
    F: FnMut(&[u8]),
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => on_data(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Timing of a submitted frame, matched to output in FIFO order
#[derive(Debug, Clone, Copy)]
struct PendingFrame {
    timestamp_us: u64,
    duration_us: u64,
}

/// H.264 encoder (libx264, High profile, no B-frames)
pub struct FfmpegVideoEncoder {
    binary: PathBuf,
    output: Option<ChunkCallback>,
    config: Option<VideoEncoderConfig>,
    pending: Arc<Mutex<VecDeque<PendingFrame>>>,
    process: Option<EncoderProcess>,
    submitted: u64,
    state: EncoderState,
}

impl FfmpegVideoEncoder {
    pub fn new(binary: &Path, output: ChunkCallback) -> Self {
        Self {
            binary: binary.to_path_buf(),
            output: Some(output),
            config: None,
            pending: Arc::new(Mutex::new(VecDeque::new())),
            process: None,
            submitted: 0,
            state: EncoderState::Unconfigured,
        }
    }

    fn args(config: &VideoEncoderConfig) -> Vec<String> {
        let size = format!("{}x{}", config.width, config.height);
        let rate = config.frame_rate.to_string();
        let bitrate = config.bitrate.to_string();
        let bufsize = (config.bitrate as u64 * 2).to_string();
        let gop = config.keyframe_interval.to_string();
        let force_key_frames = format!("expr:eq(mod(n,{}),0)", gop);

        [
            "-hide_banner", "-loglevel", "error", "-nostats",
            "-f", "rawvideo", "-pix_fmt", "rgba",
            "-s", size.as_str(),
            "-r", rate.as_str(),
            "-i", "-",
            "-c:v", H264_ENCODER,
            "-preset", "veryfast",
            "-tune", "zerolatency",
            "-profile:v", "high",
            "-level", "4.0",
            "-pix_fmt", "yuv420p",
            "-b:v", bitrate.as_str(),
            "-maxrate", bitrate.as_str(),
            "-bufsize", bufsize.as_str(),
            "-g", gop.as_str(),
            "-keyint_min", gop.as_str(),
            "-sc_threshold", "0",
            "-bf", "0",
            "-force_key_frames", force_key_frames.as_str(),
            "-bsf:v", "h264_metadata=aud=insert",
            "-f", "h264",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl VideoEncoder for FfmpegVideoEncoder {
    fn configure(&mut self, config: &VideoEncoderConfig) -> Result<(), EncoderError> {
        if self.state != EncoderState::Unconfigured {
            return Err(EncoderError::Configuration("encoder already configured".to_string()));
        }
        config.validate()?;

        let output = self.output.take().ok_or(EncoderError::Closed)?;
        let pending = self.pending.clone();
        let frame_duration_us = config.frame_duration_us();

        let process = EncoderProcess::spawn(&self.binary, &Self::args(config), "h264", move |stdout| {
            let mut emitter = VideoChunkEmitter {
                pending,
                output,
                frame_duration_us,
                last: None,
                config_sent: false,
                emitted: 0,
            };
            let mut splitter = AnnexBSplitter::new();
            let mut assembler = AccessUnitAssembler::new();

            read_loop(stdout, |data| {
                for nal in splitter.push(data) {
                    if let Some(unit) = assembler.push(nal) {
                        emitter.emit(unit, &assembler);
                    }
                }
            })?;

            if let Some(unit) = splitter.finish().and_then(|nal| assembler.push(nal)) {
                emitter.emit(unit, &assembler);
            }
            if let Some(unit) = assembler.finish() {
                emitter.emit(unit, &assembler);
            }
            Ok(emitter.emitted)
        })?;

        tracing::info!(
            "Video encoder configured: {} {}x{} @ {}fps, {} bps",
            config.codec.codec_string(),
            config.width,
            config.height,
            config.frame_rate,
            config.bitrate
        );

        self.process = Some(process);
        self.config = Some(config.clone());
        self.state = EncoderState::Configured;
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame, key_frame: bool) -> Result<(), EncoderError> {
        let (config, process) = match (&self.config, self.process.as_mut()) {
            (Some(config), Some(process)) if self.state == EncoderState::Configured => (config, process),
            _ if self.state == EncoderState::Unconfigured => return Err(EncoderError::NotConfigured),
            _ => return Err(EncoderError::Closed),
        };

        let picture = &frame.picture;
        if picture.width != config.width || picture.height != config.height || !picture.is_well_formed() {
            return Err(EncoderError::Encode(format!(
                "frame {}x{} does not match encoder {}x{}",
                picture.width, picture.height, config.width, config.height
            )));
        }

        // IDRs are scheduled by frame position; key requests off that grid are advisory
        if is_off_grid_key(key_frame, self.submitted, config.keyframe_interval) {
            tracing::debug!(
                "Key frame requested off the GOP grid at frame {} (interval {}); no IDR will be forced",
                self.submitted,
                config.keyframe_interval
            );
        }

        self.pending.lock().push_back(PendingFrame {
            timestamp_us: frame.timestamp_us,
            duration_us: frame.duration_us,
        });
        if let Err(e) = process.write(&picture.rgba) {
            self.pending.lock().pop_back();
            return Err(e);
        }
        self.submitted += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EncoderError> {
        let Some(process) = self.process.take() else {
            return Ok(());
        };
        self.state = EncoderState::Closed;
        process.finish().map(|_| ())
    }

    fn close(&mut self) {
        if let Some(process) = self.process.take() {
            process.kill();
        }
        self.state = EncoderState::Closed;
    }

    fn state(&self) -> EncoderState {
        self.state
    }
}

impl Drop for FfmpegVideoEncoder {
    fn drop(&mut self) {
        self.close();
    }
}

struct VideoChunkEmitter {
    pending: Arc<Mutex<VecDeque<PendingFrame>>>,
    output: ChunkCallback,
    frame_duration_us: u64,
    last: Option<PendingFrame>,
    config_sent: bool,
    emitted: u64,
}

impl VideoChunkEmitter {
    fn emit(&mut self, unit: AccessUnit, assembler: &AccessUnitAssembler) {
        let timing = match self.pending.lock().pop_front() {
            Some(timing) => timing,
            None => {
                tracing::warn!("Encoder produced more pictures than were submitted");
                let duration_us = self.frame_duration_us;
                PendingFrame {
                    timestamp_us: self.last.map(|l| l.timestamp_us + l.duration_us).unwrap_or(0),
                    duration_us,
                }
            }
        };
        self.last = Some(timing);

        let decoder_config = if self.config_sent {
            None
        } else {
            let config = assembler.decoder_config();
            if config.is_none() {
                tracing::warn!("First access unit arrived before SPS/PPS");
            }
            self.config_sent = config.is_some();
            config
        };

        (self.output)(EncodedChunk {
            data: unit.to_length_prefixed(),
            timestamp_us: timing.timestamp_us,
            duration_us: timing.duration_us,
            is_key: unit.is_key(),
            decoder_config,
        });
        self.emitted += 1;
    }
}

/// AAC-LC encoder (FFmpeg native `aac`)
pub struct FfmpegAudioEncoder {
    binary: PathBuf,
    output: Option<ChunkCallback>,
    config: Option<AudioEncoderConfig>,
    first_timestamp_us: Arc<Mutex<Option<u64>>>,
    process: Option<EncoderProcess>,
    submitted_frames: u64,
    state: EncoderState,
}

impl FfmpegAudioEncoder {
    pub fn new(binary: &Path, output: ChunkCallback) -> Self {
        Self {
            binary: binary.to_path_buf(),
            output: Some(output),
            config: None,
            first_timestamp_us: Arc::new(Mutex::new(None)),
            process: None,
            submitted_frames: 0,
            state: EncoderState::Unconfigured,
        }
    }

    fn args(config: &AudioEncoderConfig) -> Vec<String> {
        let rate = config.sample_rate.to_string();
        let channels = config.channels.to_string();
        let bitrate = config.bitrate.to_string();

        [
            "-hide_banner", "-loglevel", "error", "-nostats",
            "-f", "s16le",
            "-ar", rate.as_str(),
            "-ac", channels.as_str(),
            "-i", "-",
            "-c:a", AAC_ENCODER,
            "-b:a", bitrate.as_str(),
            "-f", "adts",
            "-",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl AudioEncoder for FfmpegAudioEncoder {
    fn configure(&mut self, config: &AudioEncoderConfig) -> Result<(), EncoderError> {
        if self.state != EncoderState::Unconfigured {
            return Err(EncoderError::Configuration("encoder already configured".to_string()));
        }
        config.validate()?;

        let mut output = self.output.take().ok_or(EncoderError::Closed)?;
        let first_timestamp_us = self.first_timestamp_us.clone();
        let sample_rate = config.sample_rate as u64;
        let frame_duration_us = AAC_FRAME_SAMPLES * 1_000_000 / sample_rate;

        let process = EncoderProcess::spawn(&self.binary, &Self::args(config), "aac", move |stdout| {
            let mut parser = AdtsParser::new();
            let mut emitted = 0u64;

            read_loop(stdout, |data| {
                for frame in parser.push(data) {
                    let base = first_timestamp_us.lock().unwrap_or(0);
                    output(EncodedChunk {
                        data: frame.payload,
                        timestamp_us: base + emitted * AAC_FRAME_SAMPLES * 1_000_000 / sample_rate,
                        duration_us: frame_duration_us,
                        is_key: true,
                        decoder_config: (emitted == 0).then(|| frame.header.audio_specific_config()),
                    });
                    emitted += 1;
                }
            })?;
            Ok(emitted)
        })?;

        tracing::info!(
            "Audio encoder configured: {} {} Hz x {} ch, {} bps",
            config.codec.codec_string(),
            config.sample_rate,
            config.channels,
            config.bitrate
        );

        self.process = Some(process);
        self.config = Some(config.clone());
        self.state = EncoderState::Configured;
        Ok(())
    }

    fn encode(&mut self, buffer: AudioBuffer) -> Result<(), EncoderError> {
        let (config, process) = match (&self.config, self.process.as_mut()) {
            (Some(config), Some(process)) if self.state == EncoderState::Configured => (config, process),
            _ if self.state == EncoderState::Unconfigured => return Err(EncoderError::NotConfigured),
            _ => return Err(EncoderError::Closed),
        };

        if buffer.channels != config.channels || buffer.sample_rate != config.sample_rate {
            return Err(EncoderError::Encode(format!(
                "buffer {} Hz x {} ch does not match encoder {} Hz x {} ch",
                buffer.sample_rate, buffer.channels, config.sample_rate, config.channels
            )));
        }

        let rate = config.sample_rate as u64;
        let first = *self
            .first_timestamp_us
            .lock()
            .get_or_insert(buffer.timestamp_us);

        // Output timestamps are derived from the sample count, so gaps in the
        // input timeline are filled with silence to keep the tracks aligned
        let expected_us = first + self.submitted_frames * 1_000_000 / rate;
        if buffer.timestamp_us > expected_us {
            let gap_frames = (buffer.timestamp_us - expected_us) * rate / 1_000_000;
            if gap_frames >= AAC_FRAME_SAMPLES {
                tracing::debug!("Filling {} frames of silence in audio timeline", gap_frames);
                let silence = vec![0u8; gap_frames as usize * config.channels as usize * 2];
                process.write(&silence)?;
                self.submitted_frames += gap_frames;
            }
        }

        let bytes: Vec<u8> = buffer.samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        process.write(&bytes)?;
        self.submitted_frames += buffer.frames() as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), EncoderError> {
        let Some(process) = self.process.take() else {
            return Ok(());
        };
        self.state = EncoderState::Closed;
        process.finish().map(|_| ())
    }

    fn close(&mut self) {
        if let Some(process) = self.process.take() {
            process.kill();
        }
        self.state = EncoderState::Closed;
    }

    fn state(&self) -> EncoderState {
        self.state
    }
}

impl Drop for FfmpegAudioEncoder {
    fn drop(&mut self) {
        self.close();
    }
}
