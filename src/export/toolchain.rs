//! FFmpeg toolchain loader
//!
//! The toolchain is located and probed once per loader. Concurrent callers
//! share the same in-flight probe, and a failed probe leaves the loader idle
//! so a later call can retry.

use crate::export::types::TranscodeError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// A probed FFmpeg installation
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub binary: PathBuf,
    pub version: String,
    encoders: HashSet<String>,
}

impl Toolchain {
    pub fn new(binary: PathBuf, version: String, encoders: HashSet<String>) -> Self {
        Self {
            binary,
            version,
            encoders,
        }
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains(name)
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }
}

/// Extract the version from the first line of `ffmpeg -version`
pub fn parse_version(output: &str) -> Option<String> {
    let line = output.lines().next()?;
    let rest = line.strip_prefix("ffmpeg version ")?;
    rest.split_whitespace().next().map(|v| v.to_string())
}

/// Encoder names from `ffmpeg -encoders`.
///
/// Entries follow the ` ------` separator line and look like
/// ` V....D libx264              libx264 H.264 ...`.
pub fn parse_encoders(output: &str) -> HashSet<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            if flags.len() != 6 {
                return None;
            }
            parts.next().map(|name| name.to_string())
        })
        .collect()
}

/// Finds and inspects an FFmpeg binary
#[async_trait]
pub trait ToolchainProbe: Send + Sync {
    async fn probe(&self, binary: Option<PathBuf>) -> Result<Toolchain, TranscodeError>;
}

/// Probe that runs the real binary
pub struct FfmpegProbe;

impl FfmpegProbe {
    async fn run(binary: &PathBuf, arg: &str) -> Result<String, TranscodeError> {
        let output = Command::new(binary)
            .args(["-hide_banner", arg])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                TranscodeError::Toolchain(format!("Failed to run {:?}: {}", binary, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Toolchain(format!(
                "{:?} {} failed: {}",
                binary,
                arg,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl ToolchainProbe for FfmpegProbe {
    async fn probe(&self, binary: Option<PathBuf>) -> Result<Toolchain, TranscodeError> {
        let binary = binary.unwrap_or_else(|| PathBuf::from("ffmpeg"));

        // -hide_banner does not suppress the version line for -version
        let version_output = Self::run(&binary, "-version").await?;
        let version = parse_version(&version_output).unwrap_or_else(|| "unknown".to_string());

        let encoders = parse_encoders(&Self::run(&binary, "-encoders").await?);
        if encoders.is_empty() {
            return Err(TranscodeError::Toolchain(format!(
                "{:?} reported no encoders",
                binary
            )));
        }

        Ok(Toolchain::new(binary, version, encoders))
    }
}

/// Loader state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoaderState {
    Idle,
    Loading,
    Loaded,
}

/// Shared, lazily probed toolchain
pub struct ToolchainLoader {
    binary: Option<PathBuf>,
    probe: Arc<dyn ToolchainProbe>,
    cell: OnceCell<Arc<Toolchain>>,
    loading: Mutex<bool>,
}

impl ToolchainLoader {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self::with_probe(binary, Arc::new(FfmpegProbe))
    }

    pub fn with_probe(binary: Option<PathBuf>, probe: Arc<dyn ToolchainProbe>) -> Self {
        Self {
            binary,
            probe,
            cell: OnceCell::new(),
            loading: Mutex::new(false),
        }
    }

    pub fn state(&self) -> LoaderState {
        if self.cell.initialized() {
            LoaderState::Loaded
        } else if *self.loading.lock() {
            LoaderState::Loading
        } else {
            LoaderState::Idle
        }
    }

    /// The toolchain, if a load has already succeeded
    pub fn loaded(&self) -> Option<Arc<Toolchain>> {
        self.cell.get().cloned()
    }

    /// Load the toolchain, or wait for the load already in flight
    pub async fn load(&self) -> Result<Arc<Toolchain>, TranscodeError> {
        if let Some(toolchain) = self.cell.get() {
            return Ok(toolchain.clone());
        }

        let toolchain = self
            .cell
            .get_or_try_init(|| async {
                *self.loading.lock() = true;
                tracing::info!("Loading FFmpeg toolchain ({:?})", self.binary);

                let result = self.probe.probe(self.binary.clone()).await;
                *self.loading.lock() = false;

                match result {
                    Ok(toolchain) => {
                        tracing::info!(
                            "FFmpeg {} loaded from {:?} ({} encoders)",
                            toolchain.version,
                            toolchain.binary,
                            toolchain.encoder_count()
                        );
                        Ok(Arc::new(toolchain))
                    }
                    Err(e) => {
                        tracing::warn!("FFmpeg toolchain load failed: {}", e);
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(toolchain.clone())
    }
}
