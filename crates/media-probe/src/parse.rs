//! ffprobe JSON output parsing.

use serde::Deserialize;

use crate::{ProbeAudioData, ProbeError, ProbeMediaData, ProbeVideoData, Result};

#[derive(Deserialize)]
struct RawStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    duration: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    bit_rate: Option<String>,
}

#[derive(Deserialize, Default)]
struct RawFormat {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Deserialize)]
struct RawMediaOutput {
    #[serde(default)]
    streams: Vec<RawStream>,
    #[serde(default)]
    format: RawFormat,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    pkt_pts_time: Option<String>,
}

#[derive(Deserialize)]
struct RawVideoOutput {
    #[serde(default)]
    frames: Vec<RawFrame>,
    #[serde(default)]
    streams: Vec<RawStream>,
    #[serde(default)]
    format: RawFormat,
}

fn parse_seconds(field: &'static str, value: Option<&str>) -> Result<Option<f64>> {
    match value {
        None | Some("") => Ok(None),
        Some(v) => v
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ProbeError::InvalidField {
                field,
                value: v.to_string(),
            }),
    }
}

/// Parse `ffprobe -show_format -show_streams -of json` output.
pub fn parse_media_output(stdout: &[u8]) -> Result<ProbeMediaData> {
    let raw: RawMediaOutput = serde_json::from_slice(stdout)?;

    let format_duration = parse_seconds("format.duration", raw.format.duration.as_deref())?;

    let mut data = ProbeMediaData {
        duration: format_duration.unwrap_or_default(),
        ..Default::default()
    };

    if let Some(format_name) = raw.format.format_name {
        data.format_name = format_name.split(',').map(str::to_string).collect();
    }

    for stream in &raw.streams {
        // streams may lack their own duration; fall back to the container's
        let duration = parse_seconds("stream.duration", stream.duration.as_deref())?
            .or(format_duration)
            .unwrap_or_default();

        match stream.codec_type.as_deref() {
            Some("video") => {
                if data.video.is_some() {
                    tracing::warn!("multiple video streams found, using the first");
                    continue;
                }
                data.video = Some(ProbeVideoData {
                    width: stream.width.unwrap_or_default(),
                    height: stream.height.unwrap_or_default(),
                    duration,
                    keyframes: None,
                });
            }
            Some("audio") => {
                let bitrate = match stream.bit_rate.as_deref() {
                    None | Some("") => 0.0,
                    Some(v) => v.parse::<f64>().map_err(|_| ProbeError::InvalidField {
                        field: "stream.bit_rate",
                        value: v.to_string(),
                    })?,
                };
                data.audio.push(ProbeAudioData { duration, bitrate });
            }
            _ => {}
        }
    }

    Ok(data)
}

/// Parse `ffprobe -skip_frame nokey … -of json` output into keyframe data.
pub fn parse_video_output(stdout: &[u8]) -> Result<ProbeVideoData> {
    let raw: RawVideoOutput = serde_json::from_slice(stdout)?;

    let stream = raw.streams.first();
    let duration = parse_seconds("format.duration", raw.format.duration.as_deref())?
        .or(parse_seconds(
            "stream.duration",
            stream.and_then(|s| s.duration.as_deref()),
        )?)
        .unwrap_or_default();

    let mut keyframes = Vec::new();
    for frame in &raw.frames {
        let Some(pts) = frame.pkt_pts_time.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };
        let pts = pts.parse::<f64>().map_err(|_| ProbeError::InvalidField {
            field: "frame.pkt_pts_time",
            value: pts.to_string(),
        })?;
        keyframes.push(pts);
    }

    Ok(ProbeVideoData {
        width: stream.and_then(|s| s.width).unwrap_or_default(),
        height: stream.and_then(|s| s.height).unwrap_or_default(),
        duration,
        keyframes: Some(keyframes),
    })
}
