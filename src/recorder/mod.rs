//! Recording system module
//!
//! This module implements the capture pipeline:
//! - Timeline that timestamps both tracks from one session clock
//! - CaptureEngine for direct encode → mux into MP4
//! - CaptureStrategy trait so fallback recorders can stand in for the engine
//! - RecordingCoordinator to try strategies in order and deliver the result

pub mod coordinator;
pub mod engine;
pub mod state;
pub mod strategy;
pub mod timeline;

pub use coordinator::{RecordingCoordinator, RecordingEvent};
pub use engine::CaptureEngine;
pub use state::{RecordingSegment, RecordingState, StartOptions};
pub use strategy::CaptureStrategy;
pub use timeline::{Clock, SessionClock, SystemClock, TimestampMode};
