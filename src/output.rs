//! Output artifact and download naming
//!
//! A finished recording is a single in-memory media object tagged with its
//! container format. Persistence is a thin wrapper that names the file after
//! the format actually produced.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Container format of a finished recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    Matroska,
    Webm,
}

impl ContainerFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "video/mp4",
            ContainerFormat::Matroska => "video/x-matroska",
            ContainerFormat::Webm => "video/webm",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Matroska => "mkv",
            ContainerFormat::Webm => "webm",
        }
    }

    /// Map a media type back to a format. Parameters such as `;codecs=` are ignored.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        match essence {
            "video/mp4" => Some(ContainerFormat::Mp4),
            "video/x-matroska" | "video/matroska" => Some(ContainerFormat::Matroska),
            "video/webm" => Some(ContainerFormat::Webm),
            _ => None,
        }
    }
}

/// A finished recording held in memory
#[derive(Debug, Clone)]
pub struct MediaArtifact {
    pub bytes: Vec<u8>,
    pub format: ContainerFormat,
}

impl MediaArtifact {
    pub fn new(bytes: Vec<u8>, format: ContainerFormat) -> Self {
        Self { bytes, format }
    }

    pub fn mime_type(&self) -> &'static str {
        self.format.mime_type()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// `<prefix>-<unix-ms>.<ext>`
    pub fn filename(&self, prefix: &str, unix_ms: i64) -> String {
        format!("{}-{}.{}", prefix, unix_ms, self.format.extension())
    }

    /// Write into `dir` under a timestamped name and return the path
    pub fn save_to_dir(&self, dir: &Path, prefix: &str) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(self.filename(prefix, chrono::Utc::now().timestamp_millis()));
        std::fs::write(&path, &self.bytes)?;
        tracing::info!(
            "Saved {} ({} bytes) to {:?}",
            self.mime_type(),
            self.len(),
            path
        );
        Ok(path)
    }
}

/// A fallback that changed what the user gets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Degradation {
    /// The direct encode path was unavailable; the fallback recorder was used
    FallbackRecording { reason: String },
    /// Conversion ran out of time; the intermediate file is delivered as is
    TranscodeTimedOut { timeout_secs: u64 },
    /// Conversion failed; the intermediate file is delivered as is
    TranscodeFailed { reason: String },
}

impl Degradation {
    pub fn timed_out(timeout: Duration) -> Self {
        Degradation::TranscodeTimedOut {
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            Degradation::FallbackRecording { reason } => {
                format!("Direct MP4 recording is unavailable ({}), using fallback recorder", reason)
            }
            Degradation::TranscodeTimedOut { timeout_secs } => format!(
                "MP4 conversion timed out after {}s, saving the original recording",
                timeout_secs
            ),
            Degradation::TranscodeFailed { reason } => {
                format!("MP4 conversion failed ({}), saving the original recording", reason)
            }
        }
    }
}

/// What a finished recording hands back to the caller
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Identifies the recording session that produced the artifact
    pub session_id: Uuid,
    pub artifact: MediaArtifact,
    /// Every fallback taken on the way, in order
    pub degradations: Vec<Degradation>,
}

impl Delivery {
    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_matches_format() {
        let mp4 = MediaArtifact::new(vec![1, 2, 3], ContainerFormat::Mp4);
        assert_eq!(mp4.filename("recording", 1_700_000_000_123), "recording-1700000000123.mp4");

        let mkv = MediaArtifact::new(vec![1], ContainerFormat::Matroska);
        assert_eq!(mkv.filename("clip", 5), "clip-5.mkv");
        assert_eq!(mkv.mime_type(), "video/x-matroska");
    }

    #[test]
    fn test_mime_type_parsing_ignores_codecs() {
        assert_eq!(
            ContainerFormat::from_mime_type("video/webm;codecs=vp8,opus"),
            Some(ContainerFormat::Webm)
        );
        assert_eq!(ContainerFormat::from_mime_type("video/mp4"), Some(ContainerFormat::Mp4));
        assert_eq!(ContainerFormat::from_mime_type("audio/ogg"), None);
    }

    #[test]
    fn test_save_to_dir() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = MediaArtifact::new(vec![9; 32], ContainerFormat::Mp4);
        let path = artifact.save_to_dir(&dir.path().join("out"), "recording").unwrap();

        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("mp4"));
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("recording-")));
        assert_eq!(std::fs::read(path).unwrap().len(), 32);
    }

    #[test]
    fn test_degradation_messages() {
        let timeout = Degradation::timed_out(Duration::from_secs(300));
        assert!(timeout.user_message().contains("300s"));
        let delivery = Delivery {
            session_id: Uuid::new_v4(),
            artifact: MediaArtifact::new(vec![], ContainerFormat::Webm),
            degradations: vec![timeout],
        };
        assert!(delivery.is_degraded());
    }
}
