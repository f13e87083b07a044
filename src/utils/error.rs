//! Error types and handling
//!
//! The capture error taxonomy shared by the engine, the muxer and the
//! fallback pipeline.

use crate::codec::EncoderError;
use crate::export::TranscodeError;
use crate::mux::MuxerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Crate-wide capture error
#[derive(Error, Debug)]
pub enum CaptureError {
    /// The direct encode path cannot run in this environment
    #[error("Unsupported capability: {0}")]
    UnsupportedCapability(String),

    #[error("Encoder configuration rejected: {0}")]
    EncoderConfigurationRejected(String),

    /// Out-of-order timestamp. Dropped silently by the engine, never returned from `add_frame`.
    #[error("Timestamp {candidate_us}us does not advance past {previous_us}us")]
    MonotonicityViolation { previous_us: u64, candidate_us: u64 },

    #[error("Muxer finalize failed: {0}")]
    MuxerFinalizeFailure(#[from] MuxerError),

    #[error("Transcode timed out after {0:?}")]
    TranscodeTimeout(Duration),

    #[error("Transcode failed: {0}")]
    TranscodeFailure(String),

    #[error("Not recording")]
    NotRecording,

    #[error("A recording is already in progress")]
    AlreadyRecording,

    #[error("Audio setup failed: {0}")]
    AudioSetup(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaptureError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::UnsupportedCapability(_) => "UNSUPPORTED_CAPABILITY",
            CaptureError::EncoderConfigurationRejected(_) => "ENCODER_CONFIGURATION_REJECTED",
            CaptureError::MonotonicityViolation { .. } => "MONOTONICITY_VIOLATION",
            CaptureError::MuxerFinalizeFailure(_) => "MUXER_FINALIZE_FAILURE",
            CaptureError::TranscodeTimeout(_) => "TRANSCODE_TIMEOUT",
            CaptureError::TranscodeFailure(_) => "TRANSCODE_FAILURE",
            CaptureError::NotRecording => "NOT_RECORDING",
            CaptureError::AlreadyRecording => "ALREADY_RECORDING",
            CaptureError::AudioSetup(_) => "AUDIO_SETUP",
            CaptureError::Io(_) => "IO_ERROR",
            CaptureError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether the caller should try the fallback recording path after this error
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            CaptureError::UnsupportedCapability(_)
                | CaptureError::EncoderConfigurationRejected(_)
                | CaptureError::AudioSetup(_)
        )
    }
}

impl From<EncoderError> for CaptureError {
    fn from(error: EncoderError) -> Self {
        match error {
            EncoderError::Unsupported(message) => CaptureError::UnsupportedCapability(message),
            other => CaptureError::EncoderConfigurationRejected(other.to_string()),
        }
    }
}

impl From<TranscodeError> for CaptureError {
    fn from(error: TranscodeError) -> Self {
        match error {
            TranscodeError::Timeout(after) => CaptureError::TranscodeTimeout(after),
            other => CaptureError::TranscodeFailure(other.to_string()),
        }
    }
}

/// Error response for callers that need a serializable error
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<CaptureError> for ErrorResponse {
    fn from(error: CaptureError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;
