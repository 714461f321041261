//! Media metadata loading with an optional JSON cache file.

use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use media_probe::ProbeMediaData;

use crate::error::Result;

const CACHE_FILE_SUFFIX: &str = ".tsgate-cache";

/// Metadata loading options.
#[derive(Debug, Clone)]
pub struct MetaOptions<'a> {
    pub media_path: &'a Path,
    pub ffprobe_binary: &'a str,
    pub video_keyframes: bool,
    pub cache: bool,
    pub cache_dir: Option<&'a Path>,
}

/// Cache file location: hashed into `cache_dir` when configured, otherwise
/// next to the media file.
pub fn cache_file_path(media_path: &Path, cache_dir: Option<&Path>) -> PathBuf {
    match cache_dir {
        Some(dir) => {
            let mut hasher = Sha1::new();
            hasher.update(media_path.as_os_str().as_encoded_bytes());
            let hash = hex::encode(hasher.finalize());
            dir.join(format!("{hash}{CACHE_FILE_SUFFIX}"))
        }
        None => {
            let mut path = media_path.as_os_str().to_owned();
            path.push(CACHE_FILE_SUFFIX);
            PathBuf::from(path)
        }
    }
}

async fn fetch_metadata(
    token: &CancellationToken,
    opts: &MetaOptions<'_>,
) -> Result<ProbeMediaData> {
    let start = std::time::Instant::now();
    info!(media = %opts.media_path.display(), "fetching metadata");

    let mut metadata =
        media_probe::probe_media(token, opts.ffprobe_binary, opts.media_path).await?;

    // use keyframes as segment boundaries when allowed and not yet known
    if opts.video_keyframes
        && let Some(video) = metadata.video.as_mut()
        && video.keyframes.is_none()
    {
        let video_data =
            media_probe::probe_video(token, opts.ffprobe_binary, opts.media_path).await?;
        video.keyframes = video_data.keyframes;
    }

    info!(
        media = %opts.media_path.display(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "fetched metadata"
    );
    Ok(metadata)
}

/// Load metadata from the cache file, or probe and cache it.
pub async fn load_metadata(
    token: &CancellationToken,
    opts: &MetaOptions<'_>,
) -> Result<ProbeMediaData> {
    if !opts.cache {
        return fetch_metadata(token, opts).await;
    }

    let cache_path = cache_file_path(opts.media_path, opts.cache_dir);
    match tokio::fs::read(&cache_path).await {
        Ok(data) => match serde_json::from_slice::<ProbeMediaData>(&data) {
            Ok(metadata) => {
                debug!(path = %cache_path.display(), "metadata cache hit");
                return Ok(metadata);
            }
            Err(err) => {
                warn!(path = %cache_path.display(), %err, "metadata cache unreadable, replacing");
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(path = %cache_path.display(), %err, "metadata cache read failed, replacing");
        }
    }

    let metadata = fetch_metadata(token, opts).await?;

    let data = serde_json::to_vec(&metadata)?;
    if let Err(err) = tokio::fs::write(&cache_path, data).await {
        warn!(path = %cache_path.display(), %err, "unable to write metadata cache");
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_path_next_to_media_without_cache_dir() {
        let path = cache_file_path(Path::new("/media/movie.mkv"), None);
        assert_eq!(path, Path::new("/media/movie.mkv.tsgate-cache"));
    }

    #[test]
    fn cache_path_is_hashed_into_cache_dir() {
        let path = cache_file_path(Path::new("/media/movie.mkv"), Some(Path::new("/tmp/meta")));
        let name = path.file_name().unwrap().to_str().unwrap();

        assert_eq!(path.parent().unwrap(), Path::new("/tmp/meta"));
        assert!(name.ends_with(CACHE_FILE_SUFFIX));
        // sha1 hex digest is 40 chars
        assert_eq!(name.len(), 40 + CACHE_FILE_SUFFIX.len());

        // distinct media paths map to distinct cache files
        let other = cache_file_path(Path::new("/media/other.mkv"), Some(Path::new("/tmp/meta")));
        assert_ne!(path, other);
    }

    #[tokio::test]
    async fn cached_metadata_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let media_path = dir.path().join("movie.mkv");

        let metadata = ProbeMediaData {
            format_name: vec!["matroska".to_string()],
            duration: 120.5,
            ..Default::default()
        };
        let cache_path = cache_file_path(&media_path, None);
        tokio::fs::write(&cache_path, serde_json::to_vec(&metadata).unwrap())
            .await
            .unwrap();

        let opts = MetaOptions {
            media_path: &media_path,
            ffprobe_binary: "/nonexistent/ffprobe",
            video_keyframes: false,
            cache: true,
            cache_dir: None,
        };
        // served from cache; the bogus ffprobe binary is never invoked
        let loaded = load_metadata(&CancellationToken::new(), &opts).await.unwrap();
        assert_eq!(loaded, metadata);
    }
}
