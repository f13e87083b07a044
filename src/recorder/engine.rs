//! Capture engine
//!
//! Direct capture path: pictures from the render loop and blocks from the
//! audio processing context are timestamped, encoded and muxed straight into
//! an in-memory MP4.

use super::state::{RecordingState, StartOptions};
use super::strategy::CaptureStrategy;
use super::timeline::{
    AudioClock, Clock, FrameDecision, SessionClock, SyncAnchor, SystemClock, TimelineConfig,
    VideoTimeline,
};
use crate::audio::{AudioPipeline, AudioPipelineConfig, BlockPoll, BlockReceiver, SampleBlock};
use crate::capture::{MediaSource, Picture, VideoFrame};
use crate::codec::{
    AudioBuffer, AudioCodec, AudioEncoder, AudioEncoderConfig, EncoderFactory, VideoCodec,
    VideoEncoder, VideoEncoderConfig,
};
use crate::config::CaptureSettings;
use crate::mux::{AudioTrackConfig, Mp4Muxer, MuxerConfig, VideoTrackConfig};
use crate::output::{ContainerFormat, MediaArtifact};
use crate::utils::error::{CaptureError, CaptureResult};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const AUDIO_POLL: Duration = Duration::from_millis(20);

/// Direct encode → mux engine
pub struct CaptureEngine {
    factory: Arc<dyn EncoderFactory>,
    settings: CaptureSettings,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<RecordingState>>,
    session: Mutex<Option<Session>>,
}

/// Resources of one recording attempt
struct Session {
    timeline: VideoTimeline,
    width: u32,
    height: u32,
    video: Box<dyn VideoEncoder>,
    muxer: Arc<Mp4Muxer>,
    audio: Option<AudioPath>,
}

struct AudioPath {
    pipeline: AudioPipeline,
    worker: JoinHandle<Box<dyn AudioEncoder>>,
    /// Frames taken off the pipeline by the encode loop, kept or not
    frames_seen: Arc<AtomicU64>,
}

impl CaptureEngine {
    pub fn new(factory: Arc<dyn EncoderFactory>, settings: CaptureSettings) -> Self {
        Self::with_clock(factory, settings, Arc::new(SystemClock::default()))
    }

    pub fn with_clock(
        factory: Arc<dyn EncoderFactory>,
        settings: CaptureSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            factory,
            settings,
            clock,
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            session: Mutex::new(None),
        }
    }

    pub fn state(&self) -> RecordingState {
        *self.state.read()
    }

    /// Muxer settings of the active session
    pub fn muxer_config(&self) -> Option<MuxerConfig> {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.muxer.config().clone())
    }

    /// Frames accepted so far in the active session
    pub fn accepted_frames(&self) -> u64 {
        self.session
            .lock()
            .as_ref()
            .map(|session| session.timeline.accepted())
            .unwrap_or(0)
    }

    /// Audio frames the encode loop has handled so far in the active session
    pub fn audio_frames_seen(&self) -> u64 {
        self.session
            .lock()
            .as_ref()
            .and_then(|session| session.audio.as_ref())
            .map(|audio| audio.frames_seen.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Start a session.
    ///
    /// The audio track is set up only when `source` carries one.
    pub async fn start(
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
                tracing::info!("Capture engine recording ({})", self.factory.name());
                Ok(())
            }
            Err(e) => {
                *self.state.write() = RecordingState::Idle;
                tracing::warn!("Capture engine failed to start: {}", e);
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        options: &StartOptions,
        source: Option<Arc<dyn MediaSource>>,
    ) -> CaptureResult<Session> {
        let clock = SessionClock::start(self.clock.clone());
        let anchor = SyncAnchor::default();
        self.factory.probe().await?;

        let (width, height) = options.even_dimensions();
        let frame_rate = options.effective_frame_rate();
        if (width, height) != (options.width, options.height) {
            tracing::debug!(
                "Capture size {}x{} rounded to {}x{}",
                options.width,
                options.height,
                width,
                height
            );
        }

        let feed = match source.as_ref().filter(|s| s.has_audio()) {
            Some(source) => Some(
                source
                    .open_audio()
                    .map_err(|e| CaptureError::AudioSetup(e.to_string()))?,
            ),
            None => None,
        };

        let muxer = Arc::new(Mp4Muxer::new(MuxerConfig {
            video: VideoTrackConfig {
                codec: VideoCodec::Avc,
                width,
                height,
            },
            audio: feed.as_ref().map(|feed| AudioTrackConfig {
                codec: AudioCodec::Aac,
                channels: feed.channels,
                sample_rate: feed.sample_rate,
                bitrate: options.audio_bitrate,
            }),
            fast_start: Default::default(),
            first_timestamp_behavior: Default::default(),
        }));

        let video_muxer = muxer.clone();
        let mut video = self.factory.video_encoder(Box::new(move |chunk| {
            if let Err(e) = video_muxer.add_video_chunk(chunk) {
                tracing::warn!("Video chunk rejected by muxer: {}", e);
            }
        }))?;
        let video_config = VideoEncoderConfig {
            codec: VideoCodec::Avc,
            width,
            height,
            bitrate: options.video_bitrate,
            frame_rate,
            keyframe_interval: frame_rate * self.settings.keyframe_interval_secs.max(1),
        };
        if let Err(e) = video.configure(&video_config) {
            video.close();
            return Err(e.into());
        }

        let audio = match feed {
            Some(feed) => match self.open_audio(feed, options, &muxer, &clock, &anchor) {
                Ok(audio) => Some(audio),
                Err(e) => {
                    video.close();
                    return Err(e);
                }
            },
            None => None,
        };

        let timeline = VideoTimeline::new(
            TimelineConfig {
                frame_rate,
                warmup_frames: self.settings.warmup_frames,
                keyframe_interval_secs: self.settings.keyframe_interval_secs,
                mode: self.settings.timestamp_mode,
            },
            clock,
            anchor,
        );

        tracing::info!(
            "Session opened: {}x{} @ {}fps, {} bps video, audio: {}",
            width,
            height,
            frame_rate,
            options.video_bitrate,
            audio.is_some()
        );

        Ok(Session {
            timeline,
            width,
            height,
            video,
            muxer,
            audio,
        })
    }

    fn open_audio(
        &self,
        feed: crate::capture::AudioFeed,
        options: &StartOptions,
        muxer: &Arc<Mp4Muxer>,
        clock: &SessionClock,
        anchor: &SyncAnchor,
    ) -> CaptureResult<AudioPath> {
        let audio_muxer = muxer.clone();
        let mut encoder = self.factory.audio_encoder(Box::new(move |chunk| {
            if let Err(e) = audio_muxer.add_audio_chunk(chunk) {
                tracing::warn!("Audio chunk rejected by muxer: {}", e);
            }
        }))?;
        let config = AudioEncoderConfig {
            codec: AudioCodec::Aac,
            sample_rate: feed.sample_rate,
            channels: feed.channels,
            bitrate: options.audio_bitrate,
        };
        if let Err(e) = encoder.configure(&config) {
            encoder.close();
            return Err(e.into());
        }

        let (pipeline, receiver) = match AudioPipeline::connect(
            feed,
            AudioPipelineConfig {
                mode: self.settings.audio_processing,
                block_frames: self.settings.audio_block_frames,
                channel_capacity: self.settings.audio_channel_capacity,
            },
        ) {
            Ok(connected) => connected,
            Err(e) => {
                encoder.close();
                return Err(CaptureError::AudioSetup(e.to_string()));
            }
        };

        let audio_clock = AudioClock::new(
            self.settings.timestamp_mode,
            config.sample_rate,
            clock.clone(),
            anchor.clone(),
        );
        let state = self.state.clone();
        let frames_seen = Arc::new(AtomicU64::new(0));
        let seen = frames_seen.clone();
        let worker = std::thread::Builder::new()
            .name("audio-encoder".into())
            .spawn(move || pump_audio(receiver, encoder, audio_clock, state, seen))
            .map_err(|e| CaptureError::AudioSetup(e.to_string()))?;

        Ok(AudioPath {
            pipeline,
            worker,
            frames_seen,
        })
    }

    /// Offer one picture from the render loop
    pub fn add_frame(&self, picture: Picture) {
        if !self.state.read().is_capturing() {
            return;
        }
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return;
        };

        if !picture.is_well_formed() || picture.width < session.width || picture.height < session.height
        {
            tracing::warn!(
                "Dropping malformed {}x{} picture for {}x{} session",
                picture.width,
                picture.height,
                session.width,
                session.height
            );
            return;
        }

        let slot = match session.timeline.next_frame() {
            FrameDecision::Accept(slot) => slot,
            FrameDecision::WarmUp => {
                tracing::trace!("Warm-up frame {} discarded", session.timeline.offered());
                return;
            }
            FrameDecision::Throttled => {
                tracing::trace!("Frame throttled");
                return;
            }
            FrameDecision::OutOfOrder {
                previous_us,
                candidate_us,
            } => {
                let violation = CaptureError::MonotonicityViolation {
                    previous_us,
                    candidate_us,
                };
                tracing::debug!("Frame dropped: {}", violation);
                return;
            }
        };

        let frame = VideoFrame {
            picture: picture.cropped(session.width, session.height),
            timestamp_us: slot.timestamp_us,
            duration_us: slot.duration_us,
        };
        if let Err(e) = session.video.encode(frame, slot.key_frame) {
            tracing::warn!("Encoding frame {} failed: {}", slot.index, e);
        }
    }

    pub fn pause(&self) -> CaptureResult<()> {
        let mut state = self.state.write();
        if *state != RecordingState::Recording {
            return Err(CaptureError::NotRecording);
        }
        if let Some(session) = self.session.lock().as_ref() {
            session.timeline.clock().pause();
        }
        *state = RecordingState::Paused;
        tracing::info!("Capture engine paused");
        Ok(())
    }

    pub fn resume(&self) -> CaptureResult<()> {
        let mut state = self.state.write();
        if *state != RecordingState::Paused {
            return Err(CaptureError::NotRecording);
        }
        if let Some(session) = self.session.lock().as_ref() {
            session.timeline.clock().resume();
        }
        *state = RecordingState::Recording;
        tracing::info!("Capture engine resumed");
        Ok(())
    }

    /// Flush, close and finalize. Returns the finished MP4.
    pub async fn stop(&self) -> CaptureResult<MediaArtifact> {
        {
            let mut state = self.state.write();
            if !matches!(*state, RecordingState::Recording | RecordingState::Paused) {
                return Err(CaptureError::NotRecording);
            }
            *state = RecordingState::Stopping;
        }

        let session = self.session.lock().take();
        let result = match session {
            Some(session) => tokio::task::spawn_blocking(move || session.finish())
                .await
                .unwrap_or_else(|e| {
                    Err(CaptureError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("finalize task failed: {}", e),
                    )))
                }),
            None => Err(CaptureError::NotRecording),
        };

        *self.state.write() = RecordingState::Idle;
        match &result {
            Ok(artifact) => tracing::info!("Capture engine stopped: {} bytes", artifact.len()),
            Err(e) => tracing::error!("Capture engine stop failed: {}", e),
        }
        result
    }
}

impl Session {
    /// Release everything, then finalize. Only finalization can fail.
    fn finish(mut self) -> CaptureResult<MediaArtifact> {
        tracing::debug!(
            "Finishing session: {} frames accepted of {} offered",
            self.timeline.accepted(),
            self.timeline.offered()
        );

        if let Err(e) = self.video.flush() {
            tracing::error!("Video encoder flush failed: {}", e);
        }
        self.video.close();

        if let Some(AudioPath {
            mut pipeline,
            worker,
            ..
        }) = self.audio.take()
        {
            // The encoder thread exits once the disconnected pipeline has drained
            pipeline.disconnect();
            match worker.join() {
                Ok(mut encoder) => {
                    if let Err(e) = encoder.flush() {
                        tracing::error!("Audio encoder flush failed: {}", e);
                    }
                    encoder.close();
                }
                Err(_) => tracing::error!("Audio encoder thread panicked"),
            }
            if pipeline.dropped_frames() > 0 {
                tracing::warn!(
                    "{} audio frames dropped on overflow",
                    pipeline.dropped_frames()
                );
            }
        }

        let size = self.muxer.finalize()?;
        let bytes = self.muxer.take_buffer()?;
        tracing::debug!("Muxer finalized: {} bytes", size);
        Ok(MediaArtifact::new(bytes, ContainerFormat::Mp4))
    }
}

/// Audio encode loop. Runs until the pipeline closes, then hands the encoder back.
fn pump_audio(
    mut receiver: BlockReceiver,
    mut encoder: Box<dyn AudioEncoder>,
    mut clock: AudioClock,
    state: Arc<RwLock<RecordingState>>,
    frames_seen: Arc<AtomicU64>,
) -> Box<dyn AudioEncoder> {
    loop {
        let block = match receiver.poll(AUDIO_POLL) {
            BlockPoll::Block(block) => block,
            BlockPoll::Empty => continue,
            BlockPoll::Closed => break,
        };
        let frames = block.frames() as u64;
        if state.read().is_capturing() {
            encode_block(encoder.as_mut(), &mut clock, block);
        }
        frames_seen.fetch_add(frames, Ordering::Release);
    }
    tracing::debug!("Audio encode loop finished after {} frames", clock.frames());
    encoder
}

fn encode_block(encoder: &mut dyn AudioEncoder, clock: &mut AudioClock, block: SampleBlock) {
    let Some(stamp) = clock.stamp(block.frames(), block.skipped_frames) else {
        return;
    };
    let mut samples = block.samples;
    if stamp.trim_frames > 0 {
        samples.drain(..stamp.trim_frames * block.channels as usize);
    }
    let buffer = AudioBuffer {
        samples,
        channels: block.channels,
        sample_rate: block.sample_rate,
        timestamp_us: stamp.timestamp_us,
    };
    if let Err(e) = encoder.encode(buffer) {
        tracing::warn!("Encoding audio at {}us failed: {}", stamp.timestamp_us, e);
    }
}

#[async_trait]
impl CaptureStrategy for CaptureEngine {
    fn name(&self) -> &str {
        "direct-mp4"
    }

    async fn try_start(
        &self,
        options: &StartOptions,
        source: Option<Arc<dyn MediaSource>>,
    ) -> CaptureResult<()> {
        self.start(options, source).await
    }

    fn add_frame(&self, picture: Picture) {
        CaptureEngine::add_frame(self, picture)
    }

    fn pause(&self) -> CaptureResult<()> {
        CaptureEngine::pause(self)
    }

    fn resume(&self) -> CaptureResult<()> {
        CaptureEngine::resume(self)
    }

    async fn stop(&self) -> CaptureResult<MediaArtifact> {
        CaptureEngine::stop(self).await
    }

    fn state(&self) -> RecordingState {
        CaptureEngine::state(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioFeed, SourceError, TestPatternSource, TrackInfo, TrackKind, TrackSettings};
    use crate::codec::testing::ScriptedEncoderFactory;
    use crate::recorder::timeline::{ManualClock, TimestampMode};
    use crossbeam_channel::Sender;
    use std::sync::atomic::AtomicBool;

    fn engine(factory: &ScriptedEncoderFactory) -> (Arc<ManualClock>, CaptureEngine) {
        engine_with(factory, CaptureSettings::default())
    }

    fn engine_with(
        factory: &ScriptedEncoderFactory,
        settings: CaptureSettings,
    ) -> (Arc<ManualClock>, CaptureEngine) {
        let clock = Arc::new(ManualClock::default());
        let engine = CaptureEngine::with_clock(Arc::new(factory.clone()), settings, clock.clone());
        (clock, engine)
    }

    fn picture(width: u32, height: u32) -> Picture {
        Picture::new(width, height, vec![128; (width * height * 4) as usize])
    }

    fn count_boxes(data: &[u8], typ: &[u8; 4]) -> usize {
        data.windows(4).filter(|w| w == typ).count()
    }

    /// Source whose audio samples are pushed by the test
    struct ScriptedAudioSource {
        feed: Mutex<Option<AudioFeed>>,
    }

    impl ScriptedAudioSource {
        fn new(sample_rate: u32) -> (Sender<Vec<f32>>, Arc<dyn MediaSource>) {
            let (tx, rx) = crossbeam_channel::unbounded();
            let source = ScriptedAudioSource {
                feed: Mutex::new(Some(AudioFeed {
                    sample_rate,
                    channels: 1,
                    blocks: rx,
                })),
            };
            (tx, Arc::new(source))
        }
    }

    impl MediaSource for ScriptedAudioSource {
        fn tracks(&self) -> Vec<TrackInfo> {
            vec![TrackInfo {
                id: "mic".to_string(),
                kind: TrackKind::Audio,
                settings: TrackSettings::default(),
            }]
        }

        fn open_audio(&self) -> Result<AudioFeed, SourceError> {
            self.feed.lock().take().ok_or(SourceError::Stopped)
        }

        fn stop_all(&self) {}
    }

    /// Wait until the encode loop has taken `frames` audio frames off the pipeline
    async fn wait_for_audio(engine: &CaptureEngine, frames: u64) {
        for _ in 0..400 {
            if engine.audio_frames_seen() >= frames {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("audio encode loop saw {} of {} frames", engine.audio_frames_seen(), frames);
    }

    #[tokio::test]
    async fn test_warmup_then_single_frame_at_zero() {
        let factory = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();

        for _ in 0..6 {
            engine.add_frame(picture(64, 48));
        }

        let frames = factory.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_us, 0);
        assert!(frames[0].key_frame);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_keyframes_at_zero_and_sixty() {
        let factory = ScriptedEncoderFactory::new();
        let (clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();

        for _ in 0..(5 + 70) {
            engine.add_frame(picture(64, 48));
            clock.advance_ms(34);
        }

        let frames = factory.frames();
        assert_eq!(frames.len(), 70);
        let keys: Vec<usize> = frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.key_frame)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(keys, vec![0, 60]);
        assert_eq!(frames[60].timestamp_us, 2_000_000);
        engine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase_under_jitter() {
        for mode in [TimestampMode::ConstantFrameRate, TimestampMode::WallClock] {
            let factory = ScriptedEncoderFactory::new();
            let settings = CaptureSettings {
                timestamp_mode: mode,
                ..Default::default()
            };
            let (clock, engine) = engine_with(&factory, settings);
            engine.start(&StartOptions::new(32, 32), None).await.unwrap();

            // Render loop running anywhere between 0 and 60ms per frame
            let mut seed = 7u64;
            for _ in 0..300 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                clock.advance_ms((seed >> 33) % 61);
                engine.add_frame(picture(32, 32));
            }

            let frames = factory.frames();
            assert!(frames.len() > 10, "{:?}: too few frames", mode);
            assert!(
                frames.windows(2).all(|w| w[0].timestamp_us < w[1].timestamp_us),
                "{:?}: timestamps not strictly increasing",
                mode
            );
            engine.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_odd_capture_with_audio() {
        let factory = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine(&factory);
        let pattern = Arc::new(TestPatternSource::new(1279, 721, 30.0).with_audio(48_000));
        let source: Arc<dyn MediaSource> = pattern.clone();

        engine
            .start(&StartOptions::new(1279, 721).with_frame_rate(30), Some(source.clone()))
            .await
            .unwrap();

        let video_config = factory.log.lock().video_config.clone().unwrap();
        assert_eq!((video_config.width, video_config.height), (1278, 720));

        let muxer_config = engine.muxer_config().unwrap();
        assert_eq!((muxer_config.video.width, muxer_config.video.height), (1278, 720));
        let audio = muxer_config.audio.unwrap();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.channels, 1);

        for n in 0..6 {
            engine.add_frame(pattern.picture(n));
        }
        let frames = factory.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_us, 0);
        assert!(frames[0].key_frame);
        assert_eq!((frames[0].width, frames[0].height), (1278, 720));

        engine.stop().await.unwrap();
        source.stop_all();
    }

    #[tokio::test]
    async fn test_audio_blocks_are_timestamped_by_sample_count() {
        let factory = ScriptedEncoderFactory::new();
        let settings = CaptureSettings {
            audio_block_frames: 1024,
            ..Default::default()
        };
        let (_clock, engine) = engine_with(&factory, settings);
        let (tx, source) = ScriptedAudioSource::new(48_000);

        engine.start(&StartOptions::new(32, 32), Some(source)).await.unwrap();
        for _ in 0..6 {
            engine.add_frame(picture(32, 32));
        }
        tx.send(vec![0.1; 4096]).unwrap();

        // Blocks arriving after stop begins are discarded, so wait for the encoder
        wait_for_audio(&engine, 4096).await;
        drop(tx);

        let artifact = engine.stop().await.unwrap();
        let audio = factory.log.lock().audio.clone();
        assert_eq!(
            audio,
            vec![(0, 1024), (21_333, 1024), (42_666, 1024), (64_000, 1024)]
        );
        assert_eq!(count_boxes(&artifact.bytes, b"trak"), 2);
    }

    #[tokio::test]
    async fn test_warmup_audio_starts_with_first_frame() {
        for mode in [TimestampMode::ConstantFrameRate, TimestampMode::WallClock] {
            let factory = ScriptedEncoderFactory::new();
            let settings = CaptureSettings {
                audio_block_frames: 4800,
                timestamp_mode: mode,
                ..Default::default()
            };
            let (clock, engine) = engine_with(&factory, settings);
            let (tx, source) = ScriptedAudioSource::new(48_000);
            engine.start(&StartOptions::new(32, 32), Some(source)).await.unwrap();

            for _ in 0..5 {
                engine.add_frame(picture(32, 32));
                clock.advance_ms(40);
            }
            // 100ms of audio captured while the encoder warms up
            tx.send(vec![0.1; 4800]).unwrap();
            wait_for_audio(&engine, 4800).await;

            engine.add_frame(picture(32, 32));
            for n in 1..=2u64 {
                clock.advance_ms(100);
                tx.send(vec![0.1; 4800]).unwrap();
                wait_for_audio(&engine, 4800 * (n + 1)).await;
            }
            drop(tx);

            let artifact = engine.stop().await.unwrap();
            let frames = factory.frames();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].timestamp_us, 0, "{:?}", mode);
            assert_eq!(
                factory.log.lock().audio,
                vec![(0, 4800), (100_000, 4800)],
                "{:?}",
                mode
            );
            assert_eq!(count_boxes(&artifact.bytes, b"trak"), 2);
        }
    }

    #[tokio::test]
    async fn test_wall_clock_audio_burst_is_kept() {
        let factory = ScriptedEncoderFactory::new();
        let settings = CaptureSettings {
            audio_block_frames: 4800,
            timestamp_mode: TimestampMode::WallClock,
            ..Default::default()
        };
        let (clock, engine) = engine_with(&factory, settings);
        let (tx, source) = ScriptedAudioSource::new(48_000);
        engine.start(&StartOptions::new(32, 32), Some(source)).await.unwrap();
        for _ in 0..6 {
            engine.add_frame(picture(32, 32));
        }

        // Two blocks delivered together after a stall
        clock.advance_ms(200);
        tx.send(vec![0.1; 9600]).unwrap();
        wait_for_audio(&engine, 9600).await;
        drop(tx);

        engine.stop().await.unwrap();
        assert_eq!(
            factory.log.lock().audio,
            vec![(100_000, 4800), (200_000, 4800)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_while_render_loop_runs() {
        let factory = ScriptedEncoderFactory::new();
        let (clock, engine) = engine(&factory);
        let engine = Arc::new(engine);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let render = {
            let engine = engine.clone();
            let running = running.clone();
            std::thread::spawn(move || {
                let mut offered = 0u64;
                while running.load(Ordering::Acquire) {
                    engine.add_frame(picture(64, 48));
                    clock.advance_ms(34);
                    offered += 1;
                }
                offered
            })
        };
        for _ in 0..400 {
            if engine.accepted_frames() >= 10 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.stop().await }
        });
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.stop().await }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];
        running.store(false, Ordering::Release);
        let offered = render.join().unwrap();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(CaptureError::NotRecording))));
        assert!(offered > 10);

        let log = factory.log.lock();
        assert_eq!(log.video_flushes, 1);
        assert_eq!(log.video_closes, 1);
        assert_eq!(log.encodes_after_flush, 0);
        assert!(log.frames.len() >= 10);
        assert_eq!(engine.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_no_audio_source_gives_single_track() {
        let factory = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine(&factory);
        let source: Arc<dyn MediaSource> = Arc::new(TestPatternSource::new(64, 48, 30.0));

        engine
            .start(&StartOptions::new(64, 48), Some(source))
            .await
            .unwrap();
        assert!(engine.muxer_config().unwrap().audio.is_none());
        for _ in 0..10 {
            engine.add_frame(picture(64, 48));
        }

        let artifact = engine.stop().await.unwrap();
        assert_eq!(artifact.mime_type(), "video/mp4");
        assert_eq!(count_boxes(&artifact.bytes, b"trak"), 1);
        assert_eq!(count_boxes(&artifact.bytes, b"smhd"), 0);
        assert!(factory.log.lock().audio_config.is_none());
    }

    #[tokio::test]
    async fn test_second_stop_is_not_recording() {
        let factory = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();
        for _ in 0..6 {
            engine.add_frame(picture(64, 48));
        }

        engine.stop().await.unwrap();
        assert!(matches!(engine.stop().await, Err(CaptureError::NotRecording)));

        let log = factory.log.lock();
        assert_eq!(log.video_flushes, 1);
        assert_eq!(log.video_closes, 1);
        assert_eq!(engine.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_frames_after_stop_are_ignored() {
        let factory = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();
        for _ in 0..6 {
            engine.add_frame(picture(64, 48));
        }
        engine.stop().await.unwrap();

        engine.add_frame(picture(64, 48));
        assert_eq!(factory.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_encode_failure_does_not_end_session() {
        let factory = ScriptedEncoderFactory {
            fail_video_encode_at: Some(1),
            ..Default::default()
        };
        let (clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();

        for _ in 0..(5 + 4) {
            engine.add_frame(picture(64, 48));
            clock.advance_ms(34);
        }

        let timestamps: Vec<u64> = factory.frames().iter().map(|f| f.timestamp_us).collect();
        assert_eq!(timestamps, vec![0, 66_666, 100_000]);
        assert_eq!(engine.state(), RecordingState::Recording);
        assert!(engine.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_flush_failure_still_finalizes() {
        let factory = ScriptedEncoderFactory {
            fail_video_flush: true,
            ..Default::default()
        };
        let (_clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();
        for _ in 0..6 {
            engine.add_frame(picture(64, 48));
        }

        let artifact = engine.stop().await.unwrap();
        assert!(!artifact.is_empty());
        assert_eq!(factory.log.lock().video_closes, 1);
    }

    #[tokio::test]
    async fn test_finalize_failure_is_fatal() {
        let factory = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();

        // Only warm-up frames, so the video track stays empty
        for _ in 0..3 {
            engine.add_frame(picture(64, 48));
        }
        let error = engine.stop().await.unwrap_err();
        assert_eq!(error.code(), "MUXER_FINALIZE_FAILURE");
        assert_eq!(factory.log.lock().video_closes, 1);
        assert_eq!(engine.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_unsupported_backend_triggers_fallback() {
        let factory = ScriptedEncoderFactory {
            unsupported: true,
            ..Default::default()
        };
        let (_clock, engine) = engine(&factory);
        let error = engine.start(&StartOptions::new(64, 48), None).await.unwrap_err();
        assert!(matches!(error, CaptureError::UnsupportedCapability(_)));
        assert!(error.triggers_fallback());
        assert_eq!(engine.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_rejected_audio_releases_video_encoder() {
        let factory = ScriptedEncoderFactory {
            reject_audio: true,
            ..Default::default()
        };
        let (_clock, engine) = engine(&factory);
        let (_tx, source) = ScriptedAudioSource::new(48_000);

        let error = engine
            .start(&StartOptions::new(64, 48), Some(source))
            .await
            .unwrap_err();
        assert!(matches!(error, CaptureError::EncoderConfigurationRejected(_)));
        assert_eq!(factory.log.lock().video_closes, 1);
        assert_eq!(engine.state(), RecordingState::Idle);

        // A fresh start is possible after the failure
        let retry = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine_with(&retry, CaptureSettings::default());
        assert!(engine.start(&StartOptions::new(64, 48), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_start_while_recording_is_rejected() {
        let factory = ScriptedEncoderFactory::new();
        let (_clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();
        assert!(matches!(
            engine.start(&StartOptions::new(64, 48), None).await,
            Err(CaptureError::AlreadyRecording)
        ));
    }

    #[tokio::test]
    async fn test_pause_suspends_frames() {
        let factory = ScriptedEncoderFactory::new();
        let (clock, engine) = engine(&factory);
        engine.start(&StartOptions::new(64, 48), None).await.unwrap();
        for _ in 0..6 {
            engine.add_frame(picture(64, 48));
            clock.advance_ms(34);
        }

        engine.pause().unwrap();
        assert!(matches!(engine.pause(), Err(CaptureError::NotRecording)));
        for _ in 0..10 {
            engine.add_frame(picture(64, 48));
            clock.advance_ms(34);
        }
        assert_eq!(factory.frames().len(), 1);

        engine.resume().unwrap();
        engine.add_frame(picture(64, 48));
        let frames = factory.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].timestamp_us, 33_333);

        let artifact = engine.stop().await.unwrap();
        assert!(!artifact.is_empty());
    }
}
