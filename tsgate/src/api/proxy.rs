//! HLS proxy routes: `/hlsproxy/{source}/*`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::Uri;
use axum::response::Response;

use crate::api::error::ApiError;
use crate::api::{Server, valid_name};
use crate::hlsproxy;

/// Get or lazily create the proxy manager for `source`.
fn manager(server: &Arc<Server>, source: &str) -> Result<Arc<hlsproxy::Manager>, ApiError> {
    if let Some(manager) = server.proxy_managers.get(source) {
        return Ok(manager.clone());
    }

    let base_url = server
        .config
        .hls_proxy
        .get(source)
        .ok_or_else(|| ApiError::not_found("hls proxy source not found"))?;

    let config = hlsproxy::Config::new(base_url, &format!("/hlsproxy/{source}"));
    let manager = Arc::new(hlsproxy::Manager::new(
        source,
        server.client.clone(),
        config,
    ));
    Ok(server
        .proxy_managers
        .entry(source.to_string())
        .or_insert(manager)
        .value()
        .clone())
}

pub async fn serve(
    State(server): State<Arc<Server>>,
    Path((source, _path)): Path<(String, String)>,
    uri: Uri,
) -> Result<Response, ApiError> {
    if !valid_name(&source) {
        return Err(ApiError::bad_request("invalid parameters"));
    }

    let manager = manager(&server, &source)?;

    // the query string travels to the upstream untouched
    let request_path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    if uri.path().ends_with(".m3u8") {
        manager.serve_playlist(request_path).await
    } else {
        manager.serve_segment(request_path).await
    }
}
