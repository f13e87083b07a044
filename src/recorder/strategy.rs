//! Recording strategies
//!
//! Each way of producing a recording (direct encode, fallback recorder) is a
//! named [`CaptureStrategy`]. The coordinator tries them in order.

use super::state::{RecordingState, StartOptions};
use crate::capture::{MediaSource, Picture};
use crate::output::MediaArtifact;
use crate::utils::error::CaptureResult;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait CaptureStrategy: Send + Sync {
    /// Strategy name for logs and degradation notices
    fn name(&self) -> &str;

    /// Start a session. On failure every partially acquired resource is
    /// released and the strategy is back to idle.
    async fn try_start(
        &self,
        options: &StartOptions,
        source: Option<Arc<dyn MediaSource>>,
    ) -> CaptureResult<()>;

    /// Offer one picture. Ignored unless recording and not paused.
    fn add_frame(&self, picture: Picture);

    fn pause(&self) -> CaptureResult<()>;

    fn resume(&self) -> CaptureResult<()>;

    /// End the session and hand back the recording
    async fn stop(&self) -> CaptureResult<MediaArtifact>;

    fn state(&self) -> RecordingState;
}
