//! Container muxer
//!
//! Progressive MP4 writer fed with encoded chunks from both tracks.

pub mod boxes;
pub mod mp4;

pub use mp4::{
    AudioTrackConfig, FastStart, FirstTimestampBehavior, Mp4Muxer, MuxerConfig, MuxerError,
    VideoTrackConfig,
};
