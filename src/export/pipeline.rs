//! Transcode pipeline orchestration
//!
//! Converts an intermediate recording to MP4 with an ordered list of recipes,
//! under a caller-side timeout. When conversion cannot finish, the original
//! recording is handed back with a degradation notice instead.

use crate::config::TranscodeSettings;
use crate::export::ffmpeg::{FfmpegTranscodeBackend, TranscodeBackend};
use crate::export::toolchain::ToolchainLoader;
use crate::export::types::{TranscodeError, TranscodeProgress, TranscodeRecipe};
use crate::output::{ContainerFormat, Degradation, MediaArtifact};
use crate::utils::error::CaptureError;
use std::sync::Arc;
use std::time::Duration;

/// Intermediate → MP4 converter
pub struct TranscodePipeline {
    loader: Arc<ToolchainLoader>,
    backend: Arc<dyn TranscodeBackend>,
    recipes: Vec<TranscodeRecipe>,
    timeout: Duration,
}

impl TranscodePipeline {
    /// Primary then secondary recipe, FFmpeg backend
    pub fn new(loader: Arc<ToolchainLoader>, settings: &TranscodeSettings) -> Self {
        Self {
            loader,
            backend: Arc::new(FfmpegTranscodeBackend),
            recipes: vec![
                TranscodeRecipe::primary(settings.output_frame_rate),
                TranscodeRecipe::secondary(settings.output_frame_rate),
            ],
            timeout: settings.timeout(),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn TranscodeBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn recipes(&self) -> &[TranscodeRecipe] {
        &self.recipes
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Convert `input` to MP4, trying each recipe in turn
    pub async fn convert<F>(
        &self,
        input: &MediaArtifact,
        progress: F,
    ) -> Result<MediaArtifact, TranscodeError>
    where
        F: Fn(TranscodeProgress) + Send + Sync,
    {
        tracing::info!(
            "Starting transcode of {} bytes of {}",
            input.len(),
            input.mime_type()
        );
        progress(TranscodeProgress::preparing());

        let toolchain = self.loader.load().await?;
        let dir = tempfile::Builder::new().prefix("easycord-transcode-").tempdir()?;
        let input_path = dir.path().join(format!("input.{}", input.format.extension()));
        tokio::fs::write(&input_path, &input.bytes).await?;

        let mut last_error = None;
        for recipe in &self.recipes {
            if !toolchain.has_encoder(&recipe.video_encoder) {
                tracing::warn!(
                    "Skipping {} recipe: {} not available",
                    recipe.name,
                    recipe.video_encoder
                );
                last_error = Some(TranscodeError::CodecUnavailable(recipe.video_encoder.clone()));
                continue;
            }

            let output_path = dir.path().join(format!("output-{}.mp4", recipe.name));
            progress(TranscodeProgress::converting(&recipe.name, 0.0));

            if let Err(e) = self
                .backend
                .run(&toolchain, recipe, &input_path, &output_path, &progress)
                .await
            {
                tracing::warn!("{} recipe failed: {}", recipe.name, e);
                last_error = Some(e);
                continue;
            }

            progress(TranscodeProgress::finalizing());
            let bytes = tokio::fs::read(&output_path).await?;
            if bytes.is_empty() {
                tracing::warn!("{} recipe produced an empty file", recipe.name);
                last_error = Some(TranscodeError::EmptyOutput);
                continue;
            }

            tracing::info!("Transcode finished with {}: {} bytes", recipe.name, bytes.len());
            progress(TranscodeProgress::done());
            return Ok(MediaArtifact::new(bytes, ContainerFormat::Mp4));
        }

        Err(last_error.unwrap_or(TranscodeError::NoRecipes))
    }

    /// Convert under the timeout. Never loses the footage: on timeout or
    /// failure `input` comes back unchanged, together with the reason.
    pub async fn convert_or_original<F>(
        &self,
        input: MediaArtifact,
        progress: F,
    ) -> (MediaArtifact, Option<Degradation>)
    where
        F: Fn(TranscodeProgress) + Send + Sync,
    {
        match tokio::time::timeout(self.timeout, self.convert(&input, progress)).await {
            Ok(Ok(mp4)) => (mp4, None),
            Ok(Err(e)) => {
                let error = CaptureError::from(e);
                tracing::error!("Transcode failed, keeping original: {}", error);
                let reason = match error {
                    CaptureError::TranscodeFailure(reason) => reason,
                    other => other.to_string(),
                };
                (input, Some(Degradation::TranscodeFailed { reason }))
            }
            Err(_) => {
                tracing::error!(
                    "Transcode timed out after {:?}, keeping original",
                    self.timeout
                );
                (input, Some(Degradation::timed_out(self.timeout)))
            }
        }
    }
}
