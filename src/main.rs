//! EasyCord demo entry point
//!
//! Records a synthetic test pattern (and tone) for a few seconds, driven by
//! simulated trigger labels, and saves the result to the output directory.

use anyhow::Context;
use clap::Parser;
use easycord_lib::capture::{MediaSource, TestPatternSource};
use easycord_lib::codec::FfmpegEncoderFactory;
use easycord_lib::config::AppConfig;
use easycord_lib::export::{FfmpegIntermediateRecorder, ToolchainLoader, TranscodePipeline};
use easycord_lib::recorder::{CaptureEngine, RecordingCoordinator, RecordingEvent, StartOptions};
use easycord_lib::trigger::{TriggerCommand, TriggerMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "easycord", version, about = "Record a test pattern to MP4")]
struct Cli {
    /// Recording length in seconds
    #[arg(short, long, default_value_t = 5)]
    seconds: u64,

    /// Capture width
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Capture height
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Record video only
    #[arg(long)]
    no_audio: bool,

    /// Config file (defaults to <config_dir>/easycord/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory (overrides the config)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    easycord_lib::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("loading configuration")?;
    if let Some(output) = cli.output {
        config.output.directory = output;
    }

    tracing::info!("Starting EasyCord v{}", env!("CARGO_PKG_VERSION"));

    let mut pattern = TestPatternSource::new(cli.width, cli.height, config.capture.frame_rate as f64);
    if !cli.no_audio {
        pattern = pattern.with_audio(config.capture.audio_sample_rate);
    }
    let pattern = Arc::new(pattern);
    let source: Arc<dyn MediaSource> = pattern.clone();

    let loader = Arc::new(ToolchainLoader::new(config.transcode.ffmpeg_path.clone()));
    let mut coordinator = RecordingCoordinator::new(Some(source));
    coordinator.add_strategy(Arc::new(CaptureEngine::new(
        Arc::new(FfmpegEncoderFactory::new(loader.clone())),
        config.capture.clone(),
    )));
    coordinator.add_strategy(Arc::new(FfmpegIntermediateRecorder::new(
        loader.clone(),
        config.capture.clone(),
    )));
    coordinator.set_transcoder(Arc::new(TranscodePipeline::new(loader, &config.transcode)));

    let mut events = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                RecordingEvent::Degraded(degradation) => {
                    eprintln!("warning: {}", degradation.user_message())
                }
                RecordingEvent::Transcoding(progress) => tracing::debug!("{}", progress.message()),
                RecordingEvent::Error(message) => tracing::error!("{}", message),
                other => tracing::info!("Event: {:?}", other),
            }
        }
    });

    let options = StartOptions::from_settings(cli.width, cli.height, &config.capture);
    let mut triggers = TriggerMap::new(&config.trigger);
    let frame_interval = Duration::from_micros(1_000_000 / options.effective_frame_rate() as u64);
    let total_frames = cli.seconds * options.effective_frame_rate() as u64;

    // Recognizer output: hold the start gesture, record, then hold the stop gesture
    let hold = config.trigger.confirmation_frames as u64;
    let labels = std::iter::repeat("Open_Palm")
        .take(hold as usize)
        .chain(std::iter::repeat("None").take(total_frames as usize))
        .chain(std::iter::repeat("Closed_Fist").take(hold as usize));

    let mut ticker = tokio::time::interval(frame_interval);
    let mut delivery = None;
    for (n, label) in labels.enumerate() {
        ticker.tick().await;
        if let Some(command) = triggers.observe(label) {
            tracing::info!("Trigger: {:?}", command);
            let result = coordinator
                .handle_command(command, &options)
                .await
                .with_context(|| format!("handling {:?}", command))?;
            if command == TriggerCommand::Stop {
                delivery = result;
                break;
            }
        }
        coordinator.add_frame(pattern.picture(n as u64));
    }

    let delivery = match delivery {
        Some(delivery) => delivery,
        None => coordinator.stop().await.context("stopping recording")?,
    };
    coordinator.shutdown().await;

    let path = delivery
        .artifact
        .save_to_dir(&config.output.directory, &config.output.filename_prefix)
        .context("saving recording")?;
    tracing::info!("Saved recording {} to {}", delivery.session_id, path.display());
    for degradation in &delivery.degradations {
        eprintln!("note: {}", degradation.user_message());
    }
    println!("{}", path.display());
    Ok(())
}
