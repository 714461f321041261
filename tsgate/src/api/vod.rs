//! VOD routes: `/vod/<media path>/<resource>`.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use axum::extract::{Path, State};
use axum::response::Response;
use dashmap::mapref::entry::Entry;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use segmenter::VideoProfile;

use crate::api::error::ApiError;
use crate::api::{Server, valid_name};
use crate::hlsvod;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

static SEGMENT_RESOURCE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9A-Za-z_-]+)-[0-9]{5}\.ts$").unwrap());

/// Resolve `.` and `..` inside a media path; never escapes the root.
fn clean_relative(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            segment => parts.push(segment),
        }
    }
    parts.join("/")
}

/// Media path under the configured root; 404 when it does not exist.
async fn resolve_media(server: &Arc<Server>, rel: &str) -> Result<PathBuf, ApiError> {
    let rel = clean_relative(rel);
    if rel.is_empty() {
        return Err(ApiError::not_found("vod not found"));
    }

    let path = server.config.vod.media_dir.join(rel);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(path),
        _ => Err(ApiError::not_found("vod not found")),
    }
}

/// Get or lazily create the VOD manager for `(profile, media path)`.
fn manager(
    server: &Arc<Server>,
    profile_name: &str,
    profile: VideoProfile,
    media_path: PathBuf,
) -> Result<Arc<hlsvod::Manager>, ApiError> {
    let id = format!("{profile_name}/{}", media_path.display());

    match server.vod_managers.entry(id.clone()) {
        Entry::Occupied(entry) => Ok(entry.get().clone()),
        Entry::Vacant(entry) => {
            let root = server.vod_transcode_root().map_err(|err| {
                warn!(%err, "could not prepare transcode root");
                ApiError::internal("could not create temp dir")
            })?;
            let dir = tempfile::Builder::new()
                .prefix(&format!("vod-{profile_name}-"))
                .tempdir_in(root)
                .map_err(|err| {
                    warn!(%err, "could not create transcode dir");
                    ApiError::internal("could not create temp dir")
                })?;

            let vod = &server.config.vod;
            let config = hlsvod::Config {
                video_profile: Some(profile),
                audio_profile: Some(vod.audio_profile),
                video_keyframes: vod.video_keyframes,
                cache: vod.cache,
                cache_dir: vod.cache_dir.clone(),
                ffmpeg_binary: vod.ffmpeg_binary.clone(),
                ffprobe_binary: vod.ffprobe_binary.clone(),
                ..hlsvod::Config::new(media_path, dir.path(), profile_name)
            };

            let manager = Arc::new(hlsvod::Manager::new(id, config, Some(dir)));
            manager.start();
            entry.insert(manager.clone());
            Ok(manager)
        }
    }
}

/// Master playlist: profiles filtered against the media resolution (no
/// upscaling), bandwidth with a 5% overhead, sorted ascending.
async fn serve_master(server: &Arc<Server>, media_path: PathBuf) -> Result<Response, ApiError> {
    let vod = &server.config.vod;
    let metadata = hlsvod::load_metadata(
        &CancellationToken::new(),
        &hlsvod::MetaOptions {
            media_path: &media_path,
            ffprobe_binary: &vod.ffprobe_binary,
            video_keyframes: vod.video_keyframes,
            cache: vod.cache,
            cache_dir: vod.cache_dir.as_deref(),
        },
    )
    .await
    .map_err(|err| {
        warn!(media = %media_path.display(), %err, "unable to probe vod media");
        ApiError::internal("unable to probe media")
    })?;

    let mut profiles: Vec<(String, VideoProfile, u64)> = Vec::new();
    for (name, profile) in &vod.video_profiles {
        // no upscaling: drop profiles larger than the source in both axes
        if let Some(video) = &metadata.video
            && profile.width > video.width
            && profile.height > video.height
        {
            debug!(profile = %name, "skipping upscaling profile");
            continue;
        }
        let bandwidth = (profile.bitrate + vod.audio_profile.bitrate) as u64 * 1050;
        profiles.push((name.clone(), *profile, bandwidth));
    }

    let playlist = segmenter::master_playlist(&profiles, |name| format!("{name}.m3u8"));

    Response::builder()
        .header("Content-Type", PLAYLIST_CONTENT_TYPE)
        .body(playlist.into())
        .map_err(|e| ApiError::internal(e.to_string()))
}

pub async fn serve(
    State(server): State<Arc<Server>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    // everything after the last slash is the HLS resource, everything
    // before it is the media path
    let Some((media_rel, resource)) = path.rsplit_once('/') else {
        return Err(ApiError::bad_request("invalid parameters"));
    };

    if resource == "index.m3u8" {
        let media_path = resolve_media(&server, media_rel).await?;
        return serve_master(&server, media_path).await;
    }

    if let Some(profile_name) = resource.strip_suffix(".m3u8") {
        if !valid_name(profile_name) {
            return Err(ApiError::bad_request("invalid parameters"));
        }
        let profile = *server
            .config
            .vod
            .video_profiles
            .get(profile_name)
            .ok_or_else(|| ApiError::not_found("profile not found"))?;
        let media_path = resolve_media(&server, media_rel).await?;

        let manager = manager(&server, profile_name, profile, media_path)?;
        return manager.serve_playlist().await;
    }

    let profile_name = SEGMENT_RESOURCE_REGEX
        .captures(resource)
        .map(|c| c.get(1).unwrap().as_str().to_string())
        .ok_or_else(|| ApiError::bad_request("bad segment path"))?;
    let profile = *server
        .config
        .vod
        .video_profiles
        .get(&profile_name)
        .ok_or_else(|| ApiError::not_found("profile not found"))?;
    let media_path = resolve_media(&server, media_rel).await?;

    let manager = manager(&server, &profile_name, profile, media_path)?;
    manager.serve_segment(resource).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_relative_resolves_dots() {
        assert_eq!(clean_relative("a/b/./c"), "a/b/c");
        assert_eq!(clean_relative("a/b/../c"), "a/c");
        assert_eq!(clean_relative("../../etc/passwd"), "etc/passwd");
        assert_eq!(clean_relative("./"), "");
    }

    #[test]
    fn segment_resource_regex_extracts_profile() {
        let captures = SEGMENT_RESOURCE_REGEX.captures("720p-00042.ts").unwrap();
        assert_eq!(&captures[1], "720p");
        assert!(SEGMENT_RESOURCE_REGEX.captures("720p-42.ts").is_none());
        assert!(SEGMENT_RESOURCE_REGEX.captures("720p-00042.mp4").is_none());
    }
}
