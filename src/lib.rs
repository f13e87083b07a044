//! EasyCord - live camera capture to a single fast-start MP4.
//!
//! Pictures and microphone samples are timestamped, encoded and muxed in
//! real time. When direct encoding is unavailable, an intermediate recording
//! is converted to MP4 with FFmpeg, and the original is kept if that fails.

pub mod audio;
pub mod capture;
pub mod codec;
pub mod config;
pub mod export;
pub mod mux;
pub mod output;
pub mod recorder;
pub mod trigger;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "easycord=debug,easycord_lib=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
