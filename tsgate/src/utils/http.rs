//! File-serving helper for segment responses.

use std::path::Path;

use axum::body::Body;
use axum::response::Response;
use tokio_util::io::ReaderStream;

use crate::api::error::ApiError;

/// Stream a file as an HTTP response with the given content type.
///
/// Missing files map to 404; everything else to 500.
pub async fn serve_file(
    path: &Path,
    content_type: &str,
    no_cache: bool,
) -> Result<Response, ApiError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::not_found("media not found"));
        }
        Err(err) => return Err(ApiError::internal(err.to_string())),
    };

    let len = file
        .metadata()
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?
        .len();

    let mut builder = Response::builder()
        .header("Content-Type", content_type)
        .header("Content-Length", len);
    if no_cache {
        builder = builder.header("Cache-Control", "no-cache");
    }

    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::internal(e.to_string()))
}
