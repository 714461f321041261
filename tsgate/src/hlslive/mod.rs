//! Live HLS transcoding.
//!
//! One long-lived transcoder per (source, profile) pair. The transcoder's
//! stdout carries the HLS playlist; its working directory holds rolling
//! segment files which ffmpeg rotates on its own.

mod manager;

use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

pub use manager::Manager;

/// Factory producing a fresh transcoder command for each start.
pub type CmdFactory = Arc<dyn Fn() -> Command + Send + Sync>;

/// Live manager tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Playlist updates to buffer before the stream is considered active.
    pub hls_minimum_segments: u32,
    /// How long a playlist request may wait for the stream to become active.
    pub playlist_timeout: Duration,
    /// Idle reaper tick period.
    pub cleanup_period: Duration,
    /// Idle cutoff while active.
    pub active_idle_timeout: Duration,
    /// Idle cutoff while still starting.
    pub inactive_idle_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hls_minimum_segments: 2,
            playlist_timeout: Duration::from_secs(60),
            cleanup_period: Duration::from_secs(4),
            active_idle_timeout: Duration::from_secs(12),
            inactive_idle_timeout: Duration::from_secs(24),
        }
    }
}

/// Observer hooks. Metrics only; they do not affect control flow.
#[derive(Default)]
pub struct Events {
    pub on_start: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_cmd_log: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub on_stop: Option<Box<dyn Fn(Option<i32>) + Send + Sync>>,
}
