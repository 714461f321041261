//! VOD transcoding.
//!
//! Arbitrary media files are served as HLS: metadata is probed (and cached),
//! segment breakpoints are computed from keyframes, and segments are
//! transcoded lazily around the client's playhead with bounded look-ahead.

mod manager;
mod meta;
mod transcode;

use std::path::PathBuf;
use std::time::Duration;

use segmenter::{AudioProfile, VideoProfile};

pub use manager::Manager;
pub use meta::{MetaOptions, cache_file_path, load_metadata};
pub use transcode::{TranscodeConfig, build_args, transcode_segments};

/// VOD manager configuration for one (profile, media path) pair.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transcoded media input.
    pub media_path: PathBuf,
    /// Directory for transcoded segments.
    pub transcode_dir: PathBuf,
    /// Segment file prefix, e.g. `720p` for `720p-00042.ts`.
    pub segment_prefix: String,

    pub video_profile: Option<VideoProfile>,
    pub audio_profile: Option<AudioProfile>,
    /// Probe keyframes and align breakpoints with them.
    pub video_keyframes: bool,

    /// Persist probed metadata as a JSON file.
    pub cache: bool,
    /// Cache file directory; stored next to the media file when unset.
    pub cache_dir: Option<PathBuf>,

    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,

    /// How long a request may wait for metadata loading.
    pub ready_timeout: Duration,
    /// How long a request may wait for its segment to be transcoded.
    pub transcode_timeout: Duration,

    /// Nominal segment length in seconds.
    pub segment_length: f64,
    /// Maximum deviation from the nominal segment length.
    pub segment_offset: f64,
    /// Minimum transcoded segments ahead of the playhead.
    pub segment_buffer_min: usize,
    /// Maximum segments transcoded in one batch.
    pub segment_buffer_max: usize,
}

impl Config {
    pub fn new(
        media_path: impl Into<PathBuf>,
        transcode_dir: impl Into<PathBuf>,
        segment_prefix: impl Into<String>,
    ) -> Self {
        Self {
            media_path: media_path.into(),
            transcode_dir: transcode_dir.into(),
            segment_prefix: segment_prefix.into(),
            video_profile: None,
            audio_profile: None,
            video_keyframes: false,
            cache: false,
            cache_dir: None,
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
            ready_timeout: Duration::from_secs(80),
            transcode_timeout: Duration::from_secs(10),
            segment_length: 3.50,
            segment_offset: 1.25,
            segment_buffer_min: 3,
            segment_buffer_max: 5,
        }
    }
}
