//! ffmpeg segment transcoding.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use segmenter::{AudioProfile, VideoProfile};

use crate::error::{Error, Result};

/// One transcoding batch: a contiguous breakpoint range of one media file.
#[derive(Debug, Clone)]
pub struct TranscodeConfig {
    pub input_file_path: PathBuf,
    pub output_dir_path: PathBuf,
    /// Segment file prefix, e.g. `720p` for `720p-00042.ts`.
    pub segment_prefix: String,
    /// Index of the first produced segment.
    pub segment_offset: usize,

    /// Breakpoints covered by this batch; `len() - 1` segments.
    pub segment_times: Vec<f64>,
    pub video_profile: Option<VideoProfile>,
    pub audio_profile: Option<AudioProfile>,
}

/// Build the ffmpeg argument list for a batch.
pub fn build_args(config: &TranscodeConfig) -> Result<Vec<String>> {
    if config.segment_times.len() < 2 {
        return Err(Error::transcoder("minimum 2 segment times needed"));
    }

    let start_at = config.segment_times[0];
    let end_at = *config.segment_times.last().unwrap();

    let segment_times: Vec<String> = config.segment_times[1..]
        .iter()
        .map(|t| format!("{t:.6}"))
        .collect();
    let segment_times = segment_times.join(",");

    let mut args: Vec<String> = vec!["-loglevel".into(), "warning".into()];

    // ffmpeg can turn `-ss 0` into a negative seek timestamp which
    // avformat_seek_file rejects, so the zero start point is not passed
    if start_at > 0.0 {
        args.extend(["-ss".into(), format!("{start_at:.6}")]);
    }

    args.extend([
        "-i".into(),
        config.input_file_path.to_string_lossy().into_owned(),
        "-to".into(),
        format!("{end_at:.6}"),
        "-copyts".into(), // so that -to refers to the original timestamps
        "-force_key_frames".into(),
        segment_times.clone(),
        "-sn".into(),
    ]);

    if let Some(profile) = &config.video_profile {
        let scale = if profile.width >= profile.height {
            format!("scale=-2:{}", profile.height)
        } else {
            format!("scale={}:-2", profile.width)
        };
        args.extend([
            "-vf".into(),
            scale,
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "faster".into(),
            "-profile:v".into(),
            "high".into(),
            "-level:v".into(),
            "4.0".into(),
            "-b:v".into(),
            format!("{}k", profile.bitrate),
        ]);
    }

    if let Some(profile) = &config.audio_profile {
        args.extend([
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            format!("{}k", profile.bitrate),
        ]);
    }

    args.extend([
        "-f".into(),
        "segment".into(),
        "-segment_time_delta".into(),
        "0.2".into(),
        "-segment_format".into(),
        "mpegts".into(),
        "-segment_times".into(),
        segment_times,
        "-segment_start_number".into(),
        config.segment_offset.to_string(),
        "-segment_list_type".into(),
        "flat".into(),
        "-segment_list".into(),
        "pipe:1".into(), // completed segment names go to stdout
        config
            .output_dir_path
            .join(format!("{}-%05d.ts", config.segment_prefix))
            .to_string_lossy()
            .into_owned(),
    ]);

    Ok(args)
}

/// Spawn ffmpeg for a batch and deliver each produced segment file name.
///
/// The channel closes when the child exits. Cancelling the token kills the
/// whole transcoder process group.
pub fn transcode_segments(
    token: &CancellationToken,
    ffmpeg_binary: &str,
    config: TranscodeConfig,
) -> Result<mpsc::Receiver<String>> {
    let args = build_args(&config)?;
    debug!(ffmpeg = ffmpeg_binary, ?args, "starting transcode");

    let mut child = process_utils::group_command(ffmpeg_binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::transcoder(format!("unable to spawn ffmpeg: {e}")))?;

    let pid = child.id().unwrap_or_default();

    if let Some(stderr) = child.stderr.take() {
        process_utils::log_lines(stderr, "hlsvod", None);
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::transcoder("ffmpeg has no stdout"))?;

    let (tx, rx) = mpsc::channel(1);

    // each stdout line is one finished segment file name
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            // keep draining even when the receiver is gone, so ffmpeg
            // never blocks on the pipe
            let _ = tx.send(name.to_string()).await;
        }
    });

    // waiter: reaps the child, kills the group on cancellation
    tokio::spawn({
        let token = token.clone();
        async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    process_utils::kill_tree(pid).await;
                    child.wait().await
                }
            };
            match status {
                Ok(status) if status.success() => debug!(pid, "ffmpeg finished"),
                Ok(status) => warn!(pid, %status, "ffmpeg exited"),
                Err(err) => warn!(pid, %err, "error waiting for ffmpeg"),
            }
        }
    });

    Ok(rx)
}
