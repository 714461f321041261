//! Live HLS routes: `/{profile}/{source}/{resource}`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Response};
use tracing::warn;

use crate::api::error::ApiError;
use crate::api::{Server, valid_name};
use crate::hlslive;

static PLAY_HTML: &str = include_str!("play.html");

/// Get or lazily create the live manager for `(profile, source)`.
fn manager(
    server: &Arc<Server>,
    profile: &str,
    source: &str,
) -> Result<Arc<hlslive::Manager>, ApiError> {
    let id = format!("{profile}/{source}");
    if let Some(manager) = server.live_managers.get(&id) {
        return Ok(manager.clone());
    }

    let source_url = server
        .config
        .streams
        .get(source)
        .ok_or_else(|| ApiError::not_found("stream not found"))?
        .clone();

    let profile_path = server.config.profile_path("hls", profile).map_err(|err| {
        warn!(profile, %err, "profile path could not be found");
        ApiError::not_found("profile not found")
    })?;

    let factory: hlslive::CmdFactory = Arc::new(move || {
        let mut cmd = process_utils::group_command(&profile_path);
        cmd.arg(&source_url);
        cmd
    });

    let manager = Arc::new(hlslive::Manager::new(
        id.clone(),
        factory,
        hlslive::Config::default(),
    ));
    // double-checked: keep whichever instance landed first
    Ok(server
        .live_managers
        .entry(id)
        .or_insert(manager)
        .value()
        .clone())
}

pub async fn serve(
    State(server): State<Arc<Server>>,
    Path((profile, source, resource)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    if !valid_name(&profile) || !valid_name(&source) {
        return Err(ApiError::bad_request("invalid parameters"));
    }

    match resource.as_str() {
        "index.m3u8" => manager(&server, &profile, &source)?.serve_playlist().await,
        "play.html" => Ok(Html(PLAY_HTML).into_response()),
        file => {
            let stem = file
                .strip_suffix(".ts")
                .ok_or_else(|| ApiError::not_found("not found"))?;
            if !valid_name(stem) {
                return Err(ApiError::bad_request("invalid parameters"));
            }

            // segments never auto-start a transcoder
            let id = format!("{profile}/{source}");
            let manager = server
                .live_managers
                .get(&id)
                .map(|m| m.clone())
                .ok_or_else(|| ApiError::not_found("transcode not found"))?;
            manager.serve_media(file).await
        }
    }
}
