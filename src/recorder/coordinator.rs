//! Recording coordinator
//!
//! Tries the capture strategies in order, tracks pause/resume segments,
//! reacts to trigger commands and turns whatever the active strategy produced
//! into a [`Delivery`], converting it to MP4 when needed.

use super::state::{recorded_duration_ms, RecordingSegment, RecordingState, StartOptions};
use super::strategy::CaptureStrategy;
use crate::capture::{MediaSource, Picture};
use crate::export::{TranscodePipeline, TranscodeProgress};
use crate::output::{ContainerFormat, Degradation, Delivery};
use crate::trigger::TriggerCommand;
use crate::utils::error::{CaptureError, CaptureResult};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Recording started with the named strategy
    Started { session_id: Uuid, strategy: String },
    /// Recording stopped
    Stopped,
    /// Recording paused
    Paused,
    /// Recording resumed
    Resumed,
    /// Recording discarded
    Reset,
    /// A fallback changed what the user gets
    Degraded(Degradation),
    /// MP4 conversion progress
    Transcoding(TranscodeProgress),
    /// Error occurred
    Error(String),
}

/// Drives one recording at a time across the configured strategies
pub struct RecordingCoordinator {
    /// Current recording state
    state: Arc<RwLock<RecordingState>>,

    /// Capture strategies, most preferred first
    strategies: Vec<Arc<dyn CaptureStrategy>>,

    /// Strategy running the current recording
    active: Option<Arc<dyn CaptureStrategy>>,

    /// Id of the current recording
    session_id: Option<Uuid>,

    /// Live camera/microphone handle
    source: Option<Arc<dyn MediaSource>>,

    /// Converts non-MP4 recordings
    transcoder: Option<Arc<TranscodePipeline>>,

    /// Recording segments (one per pause/resume cycle)
    segments: Vec<RecordingSegment>,

    /// Fallbacks taken by the current recording
    degradations: Vec<Degradation>,

    /// Output of the last finished recording
    last_delivery: Option<Delivery>,

    /// Time when recording started (for process time calculation)
    start_time: Option<Instant>,

    /// Event broadcaster
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl RecordingCoordinator {
    /// Create a new recording coordinator
    pub fn new(source: Option<Arc<dyn MediaSource>>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            strategies: Vec::new(),
            active: None,
            session_id: None,
            source,
            transcoder: None,
            segments: Vec::new(),
            degradations: Vec::new(),
            last_delivery: None,
            start_time: None,
            event_tx,
        }
    }

    /// Append a strategy. Earlier strategies are preferred.
    pub fn add_strategy(&mut self, strategy: Arc<dyn CaptureStrategy>) {
        tracing::info!("Adding capture strategy: {}", strategy.name());
        self.strategies.push(strategy);
    }

    pub fn set_transcoder(&mut self, transcoder: Arc<TranscodePipeline>) {
        self.transcoder = Some(transcoder);
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        *self.state.read()
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// Name of the strategy running the current recording
    pub fn active_strategy(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.name())
    }

    pub fn last_delivery(&self) -> Option<&Delivery> {
        self.last_delivery.as_ref()
    }

    /// Get the current process time in milliseconds
    fn process_time_ms(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    fn emit(&self, event: RecordingEvent) {
        let _ = self.event_tx.send(event);
    }

    fn degrade(&mut self, degradation: Degradation) {
        tracing::warn!("{}", degradation.user_message());
        self.emit(RecordingEvent::Degraded(degradation.clone()));
        self.degradations.push(degradation);
    }

    /// Start recording.
    ///
    /// A recording already in progress is stopped first; its output becomes
    /// the last delivery.
    pub async fn start(&mut self, options: StartOptions) -> CaptureResult<()> {
        if self.active.is_some() {
            tracing::info!("Stopping current recording before starting a new one");
            if let Err(e) = self.stop().await {
                tracing::error!("Previous recording did not stop cleanly: {}", e);
            }
        }
        if self.strategies.is_empty() {
            return Err(CaptureError::UnsupportedCapability(
                "no capture strategy configured".to_string(),
            ));
        }

        *self.state.write() = RecordingState::Starting;
        self.degradations.clear();

        let mut failures: Vec<String> = Vec::new();
        let mut last_error = None;
        for strategy in self.strategies.clone() {
            match strategy.try_start(&options, self.source.clone()).await {
                Ok(()) => {
                    if !failures.is_empty() {
                        self.degrade(Degradation::FallbackRecording {
                            reason: failures.join("; "),
                        });
                    }
                    let session_id = Uuid::new_v4();
                    self.session_id = Some(session_id);
                    self.start_time = Some(Instant::now());
                    self.segments = vec![RecordingSegment::new(0, 0.0)];
                    *self.state.write() = RecordingState::Recording;
                    self.emit(RecordingEvent::Started {
                        session_id,
                        strategy: strategy.name().to_string(),
                    });
                    tracing::info!("Recording {} started with {}", session_id, strategy.name());
                    self.active = Some(strategy);
                    return Ok(());
                }
                Err(e) => {
                    if e.triggers_fallback() {
                        tracing::warn!("{} unavailable: {}", strategy.name(), e);
                    } else {
                        tracing::error!("{} failed to start: {}", strategy.name(), e);
                    }
                    failures.push(format!("{}: {}", strategy.name(), e));
                    last_error = Some(e);
                }
            }
        }

        *self.state.write() = RecordingState::Idle;
        let error = last_error.unwrap_or(CaptureError::NotRecording);
        self.emit(RecordingEvent::Error(error.to_string()));
        Err(error)
    }

    /// Forward a picture from the render loop to the active strategy
    pub fn add_frame(&self, picture: Picture) {
        if let Some(active) = &self.active {
            active.add_frame(picture);
        }
    }

    /// Pause recording
    pub fn pause(&mut self) -> CaptureResult<()> {
        let active = self.active.clone().ok_or(CaptureError::NotRecording)?;
        if self.state() != RecordingState::Recording {
            return Err(CaptureError::NotRecording);
        }
        active.pause()?;

        let end_time = self.process_time_ms();
        if let Some(segment) = self.segments.last_mut() {
            segment.end(end_time);
        }

        *self.state.write() = RecordingState::Paused;
        self.emit(RecordingEvent::Paused);
        tracing::info!("Recording paused");
        Ok(())
    }

    /// Resume recording
    pub fn resume(&mut self) -> CaptureResult<()> {
        let active = self.active.clone().ok_or(CaptureError::NotRecording)?;
        if self.state() != RecordingState::Paused {
            return Err(CaptureError::NotRecording);
        }
        active.resume()?;

        let segment = RecordingSegment::new(self.segments.len(), self.process_time_ms());
        self.segments.push(segment);

        *self.state.write() = RecordingState::Recording;
        self.emit(RecordingEvent::Resumed);
        tracing::info!("Recording resumed (segment {})", self.segments.len() - 1);
        Ok(())
    }

    /// Stop recording and deliver the result
    pub async fn stop(&mut self) -> CaptureResult<Delivery> {
        let active = self.active.take().ok_or(CaptureError::NotRecording)?;
        let was_recording = self.state() == RecordingState::Recording;
        *self.state.write() = RecordingState::Stopping;

        if was_recording {
            let end_time = self.process_time_ms();
            if let Some(segment) = self.segments.last_mut() {
                segment.end(end_time);
            }
        }

        let artifact = match active.stop().await {
            Ok(artifact) => artifact,
            Err(e) => {
                *self.state.write() = RecordingState::Idle;
                self.start_time = None;
                self.session_id = None;
                self.emit(RecordingEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let artifact = if artifact.format == ContainerFormat::Mp4 {
            artifact
        } else {
            match self.transcoder.clone() {
                Some(transcoder) => {
                    let events = self.event_tx.clone();
                    let (artifact, degradation) = transcoder
                        .convert_or_original(artifact, move |progress| {
                            let _ = events.send(RecordingEvent::Transcoding(progress));
                        })
                        .await;
                    if let Some(degradation) = degradation {
                        self.degrade(degradation);
                    }
                    artifact
                }
                None => {
                    self.degrade(Degradation::TranscodeFailed {
                        reason: "no transcoder configured".to_string(),
                    });
                    artifact
                }
            }
        };

        let duration_ms = recorded_duration_ms(&self.segments, None);
        let delivery = Delivery {
            session_id: self.session_id.take().unwrap_or_else(Uuid::new_v4),
            artifact,
            degradations: std::mem::take(&mut self.degradations),
        };
        self.last_delivery = Some(delivery.clone());

        self.start_time = None;
        *self.state.write() = RecordingState::Idle;
        self.emit(RecordingEvent::Stopped);
        tracing::info!(
            "Recording stopped. Duration: {:.0}ms over {} segment(s), {} ({} bytes)",
            duration_ms,
            self.segments.len(),
            delivery.artifact.mime_type(),
            delivery.artifact.len()
        );
        Ok(delivery)
    }

    /// Discard the current recording, if any, and the last result
    pub async fn reset(&mut self) {
        if let Some(active) = self.active.take() {
            *self.state.write() = RecordingState::Stopping;
            match active.stop().await {
                Ok(artifact) => tracing::info!("Discarded {} byte recording", artifact.len()),
                Err(e) => tracing::warn!("Discarded recording failed to stop: {}", e),
            }
        }
        self.last_delivery = None;
        self.session_id = None;
        self.segments.clear();
        self.degradations.clear();
        self.start_time = None;
        *self.state.write() = RecordingState::Idle;
        self.emit(RecordingEvent::Reset);
    }

    /// Apply a trigger command. Commands that do not match the current state are ignored.
    pub async fn handle_command(
        &mut self,
        command: TriggerCommand,
        options: &StartOptions,
    ) -> CaptureResult<Option<Delivery>> {
        match command {
            TriggerCommand::Start if self.active.is_none() => {
                self.start(options.clone()).await?;
                Ok(None)
            }
            TriggerCommand::Stop if self.active.is_some() => self.stop().await.map(Some),
            TriggerCommand::Reset => {
                self.reset().await;
                Ok(None)
            }
            _ => {
                tracing::debug!("Ignoring {:?} in state {:?}", command, self.state());
                Ok(None)
            }
        }
    }

    /// Get recording duration in milliseconds
    pub fn duration_ms(&self) -> f64 {
        let open = (self.state() == RecordingState::Recording).then(|| self.process_time_ms());
        recorded_duration_ms(&self.segments, open)
    }

    /// Stop any recording and release the media source
    pub async fn shutdown(&mut self) {
        if self.active.is_some() {
            if let Err(e) = self.stop().await {
                tracing::error!("Recording did not stop cleanly on shutdown: {}", e);
            }
        }
        if let Some(source) = self.source.take() {
            source.stop_all();
        }
        tracing::info!("Recording coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioFeed, SourceError, TrackInfo};
    use crate::codec::testing::ScriptedEncoderFactory;
    use crate::config::CaptureSettings;
    use crate::export::pipeline::tests::{pipeline, FakeBackend};
    use crate::output::MediaArtifact;
    use crate::recorder::engine::CaptureEngine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Strategy that records nothing and hands back a fixed artifact
    struct FakeStrategy {
        name: &'static str,
        start_error: Option<fn() -> CaptureError>,
        format: ContainerFormat,
        state: RwLock<RecordingState>,
        frames: AtomicUsize,
        stops: AtomicUsize,
    }

    impl FakeStrategy {
        fn new(name: &'static str, format: ContainerFormat) -> Self {
            Self {
                name,
                start_error: None,
                format,
                state: RwLock::new(RecordingState::Idle),
                frames: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            }
        }

        fn failing(name: &'static str, error: fn() -> CaptureError) -> Self {
            Self {
                start_error: Some(error),
                ..Self::new(name, ContainerFormat::Mp4)
            }
        }
    }

    #[async_trait]
    impl CaptureStrategy for FakeStrategy {
        fn name(&self) -> &str {
            self.name
        }

        async fn try_start(
            &self,
            _options: &StartOptions,
            _source: Option<Arc<dyn MediaSource>>,
        ) -> CaptureResult<()> {
            if let Some(error) = self.start_error {
                return Err(error());
            }
            *self.state.write() = RecordingState::Recording;
            Ok(())
        }

        fn add_frame(&self, _picture: Picture) {
            if *self.state.read() == RecordingState::Recording {
                self.frames.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn pause(&self) -> CaptureResult<()> {
            *self.state.write() = RecordingState::Paused;
            Ok(())
        }

        fn resume(&self) -> CaptureResult<()> {
            *self.state.write() = RecordingState::Recording;
            Ok(())
        }

        async fn stop(&self) -> CaptureResult<MediaArtifact> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *self.state.write() = RecordingState::Idle;
            Ok(MediaArtifact::new(vec![0x1A, 0x45, 0xDF, 0xA3], self.format))
        }

        fn state(&self) -> RecordingState {
            *self.state.read()
        }
    }

    #[derive(Default)]
    struct CountingSource {
        stops: AtomicUsize,
    }

    impl MediaSource for CountingSource {
        fn tracks(&self) -> Vec<TrackInfo> {
            Vec::new()
        }

        fn open_audio(&self) -> Result<AudioFeed, SourceError> {
            Err(SourceError::Stopped)
        }

        fn stop_all(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn picture() -> Picture {
        Picture::new(64, 48, vec![0; 64 * 48 * 4])
    }

    fn drain(rx: &mut broadcast::Receiver<RecordingEvent>) -> Vec<RecordingEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_direct_engine_delivers_mp4() {
        let factory = ScriptedEncoderFactory::new();
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(Arc::new(CaptureEngine::new(
            Arc::new(factory.clone()),
            CaptureSettings::default(),
        )));

        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        assert_eq!(coordinator.active_strategy(), Some("direct-mp4"));
        for _ in 0..6 {
            coordinator.add_frame(picture());
        }

        let delivery = coordinator.stop().await.unwrap();
        assert_eq!(delivery.artifact.mime_type(), "video/mp4");
        assert!(!delivery.is_degraded());
        assert_eq!(coordinator.state(), RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_unsupported_engine_falls_back_and_transcodes() {
        let factory = ScriptedEncoderFactory {
            unsupported: true,
            ..Default::default()
        };
        let fallback = Arc::new(FakeStrategy::new("fallback", ContainerFormat::Matroska));
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(Arc::new(CaptureEngine::new(
            Arc::new(factory),
            CaptureSettings::default(),
        )));
        coordinator.add_strategy(fallback.clone());
        coordinator.set_transcoder(Arc::new(pipeline(
            &["libx264", "mpeg4"],
            FakeBackend {
                failing: vec!["h264"],
                ..Default::default()
            },
        )));
        let mut events = coordinator.subscribe();

        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        assert_eq!(coordinator.active_strategy(), Some("fallback"));
        coordinator.add_frame(picture());
        assert_eq!(fallback.frames.load(Ordering::SeqCst), 1);

        let delivery = coordinator.stop().await.unwrap();
        assert_eq!(delivery.artifact.mime_type(), "video/mp4");
        assert!(!delivery.artifact.is_empty());
        assert_eq!(delivery.degradations.len(), 1);
        assert!(matches!(
            &delivery.degradations[0],
            Degradation::FallbackRecording { reason } if reason.contains("direct-mp4")
        ));

        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, RecordingEvent::Degraded(Degradation::FallbackRecording { .. }))));
        assert!(events.iter().any(|e| matches!(e, RecordingEvent::Transcoding(_))));
        assert!(matches!(events.last(), Some(RecordingEvent::Stopped)));
    }

    #[tokio::test]
    async fn test_transcode_timeout_delivers_original() {
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(Arc::new(FakeStrategy::new("fallback", ContainerFormat::Webm)));
        coordinator.set_transcoder(Arc::new(
            pipeline(
                &["libx264"],
                FakeBackend {
                    delay: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
            )
            .with_timeout(Duration::from_millis(50)),
        ));

        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        let delivery = coordinator.stop().await.unwrap();
        assert_eq!(delivery.artifact.mime_type(), "video/webm");
        assert!(matches!(
            delivery.degradations.as_slice(),
            [Degradation::TranscodeTimedOut { .. }]
        ));
    }

    #[tokio::test]
    async fn test_all_strategies_failing() {
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(Arc::new(FakeStrategy::failing("a", || {
            CaptureError::UnsupportedCapability("no encoder".into())
        })));
        coordinator.add_strategy(Arc::new(FakeStrategy::failing("b", || {
            CaptureError::AudioSetup("no microphone".into())
        })));

        let error = coordinator.start(StartOptions::new(64, 48)).await.unwrap_err();
        assert!(matches!(error, CaptureError::AudioSetup(_)));
        assert_eq!(coordinator.state(), RecordingState::Idle);
        assert!(matches!(coordinator.stop().await, Err(CaptureError::NotRecording)));
    }

    #[tokio::test]
    async fn test_trigger_commands_are_idempotent() {
        let strategy = Arc::new(FakeStrategy::new("direct", ContainerFormat::Mp4));
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(strategy.clone());
        let options = StartOptions::new(64, 48);

        assert!(coordinator
            .handle_command(TriggerCommand::Stop, &options)
            .await
            .unwrap()
            .is_none());

        coordinator.handle_command(TriggerCommand::Start, &options).await.unwrap();
        coordinator.handle_command(TriggerCommand::Start, &options).await.unwrap();
        assert_eq!(coordinator.state(), RecordingState::Recording);
        assert_eq!(strategy.stops.load(Ordering::SeqCst), 0);

        let delivery = coordinator
            .handle_command(TriggerCommand::Stop, &options)
            .await
            .unwrap();
        assert!(delivery.is_some());
        assert!(coordinator.last_delivery().is_some());
        assert_eq!(strategy.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_discards_recording() {
        let strategy = Arc::new(FakeStrategy::new("direct", ContainerFormat::Mp4));
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(strategy.clone());
        let options = StartOptions::new(64, 48);

        coordinator.handle_command(TriggerCommand::Start, &options).await.unwrap();
        coordinator.handle_command(TriggerCommand::Reset, &options).await.unwrap();

        assert_eq!(coordinator.state(), RecordingState::Idle);
        assert!(coordinator.last_delivery().is_none());
        assert_eq!(strategy.stops.load(Ordering::SeqCst), 1);
        assert!(coordinator
            .handle_command(TriggerCommand::Stop, &options)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_start_while_active_stops_previous() {
        let strategy = Arc::new(FakeStrategy::new("direct", ContainerFormat::Mp4));
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(strategy.clone());

        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        assert_eq!(strategy.stops.load(Ordering::SeqCst), 1);
        assert!(coordinator.last_delivery().is_some());
        assert_eq!(coordinator.state(), RecordingState::Recording);
    }

    #[tokio::test]
    async fn test_pause_resume_segments() {
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(Arc::new(FakeStrategy::new("direct", ContainerFormat::Mp4)));
        let mut events = coordinator.subscribe();

        assert!(matches!(coordinator.pause(), Err(CaptureError::NotRecording)));
        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        coordinator.pause().unwrap();
        assert!(matches!(coordinator.pause(), Err(CaptureError::NotRecording)));
        coordinator.resume().unwrap();
        let delivery = coordinator.stop().await.unwrap();

        assert_eq!(coordinator.segments.len(), 2);
        assert!(coordinator.duration_ms() >= 0.0);
        let events = drain(&mut events);
        match &events[0] {
            RecordingEvent::Started { session_id, strategy } => {
                assert_eq!(*session_id, delivery.session_id);
                assert_eq!(strategy, "direct");
            }
            other => panic!("unexpected first event {:?}", other),
        }
        assert!(matches!(events[1], RecordingEvent::Paused));
        assert!(matches!(events[2], RecordingEvent::Resumed));
        assert!(matches!(events[3], RecordingEvent::Stopped));
    }

    #[tokio::test]
    async fn test_missing_transcoder_is_reported() {
        let mut coordinator = RecordingCoordinator::new(None);
        coordinator.add_strategy(Arc::new(FakeStrategy::new("fallback", ContainerFormat::Matroska)));

        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        let delivery = coordinator.stop().await.unwrap();
        assert_eq!(delivery.artifact.format, ContainerFormat::Matroska);
        assert!(delivery.is_degraded());
    }

    #[tokio::test]
    async fn test_shutdown_releases_source() {
        let source = Arc::new(CountingSource::default());
        let strategy = Arc::new(FakeStrategy::new("direct", ContainerFormat::Mp4));
        let mut coordinator = RecordingCoordinator::new(Some(source.clone()));
        coordinator.add_strategy(strategy.clone());

        coordinator.start(StartOptions::new(64, 48)).await.unwrap();
        coordinator.shutdown().await;

        assert_eq!(strategy.stops.load(Ordering::SeqCst), 1);
        assert_eq!(source.stops.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), RecordingState::Idle);
    }
}
