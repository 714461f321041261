//! Gateway configuration.
//!
//! Settings are merged from three layers: the TOML config file, `TSGATE_*`
//! environment variables (via clap), and CLI flags. The configuration is
//! immutable after load; changing it means restarting the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use segmenter::{AudioProfile, VideoProfile};

use crate::error::{Error, Result};

/// Command line interface.
#[derive(Parser, Debug, Default)]
#[command(name = "tsgate", version, about = "On-demand HTTP-to-HLS transcoding gateway")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "TSGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:8080
    #[arg(short, long, env = "TSGATE_BIND")]
    pub bind: Option<String>,

    /// Directory with static files to serve at /
    #[arg(long, env = "TSGATE_STATIC")]
    pub static_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "TSGATE_DEBUG")]
    pub debug: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Listen address. Required.
    pub bind: Option<String>,

    /// TLS certificate/key. Accepted for compatibility; TLS termination is
    /// expected to happen in a fronting proxy.
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,

    /// Directory with static files served at the root.
    #[serde(rename = "static")]
    pub static_dir: Option<PathBuf>,

    /// Trust X-Forwarded-* headers. Accepted for compatibility; header
    /// handling is expected to happen in a fronting proxy.
    pub proxy: bool,

    /// Live sources: name → upstream URL.
    pub streams: HashMap<String, String>,

    /// HLS proxy sources: name → upstream base URL.
    pub hls_proxy: HashMap<String, String>,

    /// Directory containing `hls/<name>.sh` and `http/<name>.sh` profile
    /// scripts. A script is invoked with the upstream URL as its argument.
    #[serde(rename = "profiles")]
    pub profiles_dir: Option<PathBuf>,

    pub vod: VodConfig,
}

/// VOD section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct VodConfig {
    /// Root directory for VOD media files.
    pub media_dir: PathBuf,

    /// Scratch directory for transcoded segments. A temp directory is
    /// created when empty.
    pub transcode_dir: Option<PathBuf>,

    /// Video renditions: name → profile. Bitrate in kbit/s.
    pub video_profiles: HashMap<String, VideoProfile>,

    /// Shared audio rendition. Bitrate in kbit/s.
    pub audio_profile: AudioProfile,

    /// Probe video keyframes to pick segment breakpoints.
    pub video_keyframes: bool,

    /// Persist probed metadata as a JSON cache file.
    pub cache: bool,

    /// Directory for metadata cache files; stored next to the media file
    /// when unset.
    pub cache_dir: Option<PathBuf>,

    pub ffmpeg_binary: String,
    pub ffprobe_binary: String,
}

impl Default for VodConfig {
    fn default() -> Self {
        Self {
            media_dir: PathBuf::from("."),
            transcode_dir: None,
            video_profiles: HashMap::new(),
            audio_profile: AudioProfile { bitrate: 128 },
            video_keyframes: false,
            cache: false,
            cache_dir: None,
            ffmpeg_binary: "ffmpeg".to_string(),
            ffprobe_binary: "ffprobe".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the file named by the CLI (or `tsgate.toml`
    /// in the working directory), then apply CLI overrides.
    pub fn load(cli: &Cli) -> Result<Self> {
        let path = cli
            .config
            .clone()
            .or_else(|| Path::new("tsgate.toml").exists().then(|| PathBuf::from("tsgate.toml")));

        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(bind) = &cli.bind {
            config.bind = Some(bind.clone());
        }
        if let Some(static_dir) = &cli.static_dir {
            config.static_dir = Some(static_dir.clone());
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io_path(path, e))?;
        toml::from_str(&text).map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }

    fn validate(&self) -> Result<()> {
        if self.bind.as_deref().unwrap_or("").is_empty() {
            return Err(Error::config("bind address is required"));
        }

        for name in self.streams.keys().chain(self.hls_proxy.keys()) {
            if !crate::api::valid_name(name) {
                return Err(Error::config(format!("invalid source name: {name}")));
            }
        }
        for name in self.vod.video_profiles.keys() {
            if !crate::api::valid_name(name) {
                return Err(Error::config(format!("invalid profile name: {name}")));
            }
        }

        if self.ssl_cert.is_some() || self.ssl_key.is_some() {
            warn!("ssl-cert/ssl-key are not handled by tsgate; terminate TLS in a fronting proxy");
        }
        if self.proxy {
            warn!("proxy is not handled by tsgate; X-Forwarded-* headers are ignored");
        }

        Ok(())
    }

    /// Absolute path of a profile script, e.g. `profiles/hls/720p.sh`.
    pub fn profile_path(&self, kind: &str, name: &str) -> Result<PathBuf> {
        let dir = self
            .profiles_dir
            .as_ref()
            .ok_or_else(|| Error::not_found("profiles directory not configured"))?;

        let path = dir.join(kind).join(format!("{name}.sh"));
        if !path.is_file() {
            return Err(Error::not_found(format!("profile not found: {kind}/{name}")));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            bind = "0.0.0.0:8080"
            static = "/var/www"
            profiles = "profiles"

            [streams]
            cam1 = "rtsp://192.168.1.2:554/stream"

            [hls-proxy]
            origin = "https://cdn.example.com/hls"

            [vod]
            media-dir = "/mnt/media"
            video-keyframes = true
            cache = true
            cache-dir = "/tmp/tsgate-meta"

            [vod.audio-profile]
            bitrate = 128

            [vod.video-profiles.720p]
            width = 1280
            height = 720
            bitrate = 1920
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.as_deref(), Some("0.0.0.0:8080"));
        assert_eq!(config.streams["cam1"], "rtsp://192.168.1.2:554/stream");
        assert_eq!(config.hls_proxy["origin"], "https://cdn.example.com/hls");
        assert!(config.vod.video_keyframes);
        assert_eq!(
            config.vod.video_profiles["720p"],
            VideoProfile {
                width: 1280,
                height: 720,
                bitrate: 1920
            }
        );
        assert_eq!(config.vod.ffmpeg_binary, "ffmpeg");
    }

    #[test]
    fn bind_is_required() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent-dir/none.toml")),
            ..Default::default()
        };
        assert!(Config::load(&cli).is_err());

        let config = Config {
            bind: None,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_invalid_source_names() {
        let mut config = Config {
            bind: Some("127.0.0.1:8080".into()),
            ..Default::default()
        };
        config
            .streams
            .insert("bad/name".to_string(), "rtsp://x".to_string());
        assert!(config.validate().is_err());
    }
}
