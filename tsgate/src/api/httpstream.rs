//! HTTP remux streaming: `/http/{source}/{profile}`.
//!
//! Runs the profile script for the source and streams its stdout as raw
//! MPEG-TS until the client disconnects. No manager registry; one child per
//! request, torn down with the connection.

use std::process::Stdio;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::Response;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::api::error::ApiError;
use crate::api::{Server, valid_name};

/// Kills the child's process tree when the response body is dropped.
struct TreeKillGuard {
    pid: u32,
}

impl Drop for TreeKillGuard {
    fn drop(&mut self) {
        let pid = self.pid;
        tokio::spawn(async move {
            process_utils::kill_tree(pid).await;
        });
    }
}

pub async fn serve(
    State(server): State<Arc<Server>>,
    Path((source, profile)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if !valid_name(&source) || !valid_name(&profile) {
        return Err(ApiError::bad_request("invalid parameters"));
    }

    let source_url = server
        .config
        .streams
        .get(&source)
        .ok_or_else(|| ApiError::not_found("source not found"))?;

    let profile_path = server
        .config
        .profile_path("http", &profile)
        .map_err(|_| ApiError::not_found("profile not found"))?;

    let mut child = process_utils::group_command(&profile_path)
        .arg(source_url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|err| {
            warn!(source, profile, %err, "transcode could not be started");
            ApiError::internal("not available")
        })?;

    let pid = child.id().unwrap_or_default();
    info!(source, profile, pid, "http stream started");

    if let Some(stderr) = child.stderr.take() {
        process_utils::log_lines(stderr, "httpstream", None);
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ApiError::internal("transcoder has no stdout"))?;

    // the guard and the child ride along with the body; dropping the body
    // kills the whole process tree
    let guard = TreeKillGuard { pid };
    let stream = ReaderStream::new(stdout).map(move |chunk| {
        let _ = (&guard, &child);
        chunk
    });

    Response::builder()
        .header("Content-Type", "video/mp2t")
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(e.to_string()))
}
