//! ffprobe wrappers.
//!
//! Two entry points: [`probe_media`] reads container format and stream
//! metadata, [`probe_video`] lists keyframe timestamps of the video stream.
//! Both invoke the external `ffprobe` binary with JSON output and honor a
//! cancellation token by killing the child.

use std::path::Path;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;

mod parse;

pub use parse::{parse_media_output, parse_video_output};

/// Probe failure.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("unable to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    #[error("{binary} exited with {status}: {stderr}")]
    Exit {
        binary: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("unable to parse probe output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid probe field {field}: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("probe cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ProbeError>;

/// Container and stream metadata for a media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeMediaData {
    pub format_name: Vec<String>,
    /// Container duration in seconds.
    pub duration: f64,
    pub video: Option<ProbeVideoData>,
    pub audio: Vec<ProbeAudioData>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeVideoData {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
    /// Keyframe presentation timestamps, when probed.
    pub keyframes: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeAudioData {
    pub duration: f64,
    /// Bits per second as reported by ffprobe.
    pub bitrate: f64,
}

async fn run_ffprobe(
    token: &CancellationToken,
    binary: &str,
    args: &[&str],
) -> Result<Vec<u8>> {
    let mut child = Command::new(binary)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProbeError::Spawn {
            binary: binary.to_string(),
            source,
        })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|source| ProbeError::Spawn {
            binary: binary.to_string(),
            source,
        })?,
        _ = token.cancelled() => return Err(ProbeError::Cancelled),
    };

    if !output.status.success() {
        return Err(ProbeError::Exit {
            binary: binary.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    if !output.stderr.is_empty() {
        warn!(
            binary,
            "{}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(output.stdout)
}

/// Probe container format and streams of `input`.
pub async fn probe_media(
    token: &CancellationToken,
    ffprobe: &str,
    input: &Path,
) -> Result<ProbeMediaData> {
    let input = input.to_string_lossy();
    let args = [
        "-v",
        "error",
        "-show_format",
        "-show_streams",
        "-of",
        "json",
        input.as_ref(),
    ];

    let stdout = run_ffprobe(token, ffprobe, &args).await?;
    parse_media_output(&stdout)
}

/// Probe keyframe timestamps of the video stream of `input`.
pub async fn probe_video(
    token: &CancellationToken,
    ffprobe: &str,
    input: &Path,
) -> Result<ProbeVideoData> {
    let input = input.to_string_lossy();
    let args = [
        "-v",
        "error",
        "-skip_frame",
        "nokey",
        "-show_entries",
        "frame=pkt_pts_time",
        "-show_entries",
        "format=duration",
        "-show_entries",
        "stream=duration,width,height",
        "-select_streams",
        "v",
        "-of",
        "json",
        input.as_ref(),
    ];

    let stdout = run_ffprobe(token, ffprobe, &args).await?;
    parse_video_output(&stdout)
}
