//! Media source abstraction
//!
//! Providers of live camera/microphone tracks implement [`MediaSource`].
//! A synthetic test-pattern provider is included.

pub mod synthetic;
pub mod traits;

pub use synthetic::TestPatternSource;
pub use traits::{
    AudioFeed, MediaSource, Picture, SourceError, TrackInfo, TrackKind, TrackSettings, VideoFrame,
};
