//! HTTP dispatcher.
//!
//! Routes requests to per-key manager instances, creating them lazily and
//! tearing them down on shutdown. The registries live on the [`Server`]
//! value, not in globals, so tests can create isolated instances.

pub mod error;

mod httpstream;
mod live;
mod proxy;
mod vod;

use std::sync::{Arc, LazyLock};

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use tempfile::TempDir;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::{hlslive, hlsproxy, hlsvod};

static NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9A-Za-z_-]+$").unwrap());

/// Profile, source, and segment-stem names must match `^[0-9A-Za-z_-]+$`.
pub fn valid_name(name: &str) -> bool {
    NAME_REGEX.is_match(name)
}

/// Gateway server state: configuration plus the three manager registries.
pub struct Server {
    pub config: Config,
    client: reqwest::Client,

    live_managers: DashMap<String, Arc<hlslive::Manager>>,
    proxy_managers: DashMap<String, Arc<hlsproxy::Manager>>,
    vod_managers: DashMap<String, Arc<hlsvod::Manager>>,

    // fallback scratch root when vod.transcode-dir is not configured
    vod_scratch: Mutex<Option<Arc<TempDir>>>,
}

impl Server {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            config,
            client: reqwest::Client::new(),
            live_managers: DashMap::new(),
            proxy_managers: DashMap::new(),
            vod_managers: DashMap::new(),
            vod_scratch: Mutex::new(None),
        })
    }

    /// Assemble the router. All routes are GET.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut router = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .route("/hlsproxy/{source}/{*path}", get(proxy::serve))
            .route("/vod/{*path}", get(vod::serve))
            .route("/http/{source}/{profile}", get(httpstream::serve))
            .route("/{profile}/{source}/{resource}", get(live::serve));

        router = match &self.config.static_dir {
            Some(dir) => router.fallback_service(ServeDir::new(dir)),
            None => router.fallback(|| async { (StatusCode::NOT_FOUND, "404 not found") }),
        };

        router
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    /// Stop every manager. Called once on graceful shutdown.
    pub async fn shutdown(&self) {
        info!("shutting down managers");

        let live: Vec<_> = self
            .live_managers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for manager in live {
            manager.stop().await;
        }
        self.live_managers.clear();

        for entry in self.proxy_managers.iter() {
            entry.value().shutdown();
        }
        self.proxy_managers.clear();

        for entry in self.vod_managers.iter() {
            entry.value().stop();
        }
        self.vod_managers.clear();

        *self.vod_scratch.lock() = None;
    }

    /// Root directory for per-manager VOD transcode dirs.
    fn vod_transcode_root(&self) -> Result<std::path::PathBuf> {
        if let Some(dir) = &self.config.vod.transcode_dir {
            std::fs::create_dir_all(dir).map_err(|e| Error::io_path(dir, e))?;
            return Ok(dir.clone());
        }

        let mut scratch = self.vod_scratch.lock();
        if let Some(dir) = scratch.as_ref() {
            return Ok(dir.path().to_path_buf());
        }
        let dir = Arc::new(
            tempfile::Builder::new()
                .prefix("tsgate-vod-")
                .tempdir()
                .map_err(Error::Io)?,
        );
        let path = dir.path().to_path_buf();
        *scratch = Some(dir);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_server() -> Arc<Server> {
        let mut config = Config {
            bind: Some("127.0.0.1:0".to_string()),
            ..Config::default()
        };
        config
            .streams
            .insert("cam1".to_string(), "rtsp://127.0.0.1/stream".to_string());
        Server::new(config)
    }

    async fn request(server: &Arc<Server>, uri: &str) -> (StatusCode, String) {
        let response = server
            .router()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[test]
    fn name_validation() {
        assert!(valid_name("720p"));
        assert!(valid_name("cam_1-a"));
        assert!(!valid_name(""));
        assert!(!valid_name("a/b"));
        assert!(!valid_name("a.b"));
        assert!(!valid_name("café"));
    }

    #[tokio::test]
    async fn ping_answers_pong() {
        let (status, body) = request(&test_server(), "/ping").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "pong");
    }

    #[tokio::test]
    async fn live_validates_names() {
        let server = test_server();
        let (status, _) = request(&server, "/720p%2F/cam1/index.m3u8").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn live_unknown_stream_is_404() {
        let (status, _) = request(&test_server(), "/720p/nope/index.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn live_segment_without_transcode_is_404() {
        let (status, body) = request(&test_server(), "/720p/cam1/0001.ts").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("transcode not found"));
    }

    #[tokio::test]
    async fn proxy_unknown_source_is_404() {
        let (status, _) = request(&test_server(), "/hlsproxy/nope/index.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn vod_requires_a_resource_path() {
        let (status, _) = request(&test_server(), "/vod/movie.mkv").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn vod_unknown_profile_is_404() {
        let (status, _) = request(&test_server(), "/vod/movie.mkv/1080p.m3u8").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (status, _) = request(&test_server(), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn play_html_is_embedded() {
        let (status, body) = request(&test_server(), "/720p/cam1/play.html").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<video"));
    }
}
