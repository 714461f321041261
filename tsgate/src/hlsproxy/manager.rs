//! HLS proxy manager.

use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use fanout::Cache;

use crate::api::error::ApiError;

use super::{Config, playlist_url_walk, relative_path};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/MP2T";

/// Proxy for one upstream HLS source.
///
/// Every upstream URL gets a broadcast cache entry; concurrent clients
/// stream from the single in-flight fetch instead of issuing their own.
pub struct Manager {
    id: String,
    config: Config,
    client: reqwest::Client,
    cache: DashMap<String, Arc<Cache>>,
    sweep: Mutex<Option<CancellationToken>>,
}

impl Manager {
    pub fn new(id: impl Into<String>, client: reqwest::Client, config: Config) -> Self {
        Self {
            id: id.into(),
            config,
            client,
            cache: DashMap::new(),
            sweep: Mutex::new(None),
        }
    }

    /// Stop the expiry sweep. Cached entries die with the manager.
    pub fn shutdown(&self) {
        if let Some(token) = self.sweep.lock().take() {
            token.cancel();
        }
    }

    fn upstream_url(base: &str, prefix: &str, request_path: &str) -> String {
        let rest = request_path.strip_prefix(prefix).unwrap_or(request_path);
        format!("{base}{}", rest.trim_start_matches('/'))
    }

    fn cached(&self, url: &str) -> Option<Arc<Cache>> {
        let entry = self.cache.get(url)?;
        if entry.expired() {
            debug!(id = %self.id, url, "cache expired");
            return None;
        }
        debug!(id = %self.id, url, "cache hit");
        Some(entry.clone())
    }

    fn insert(self: &Arc<Self>, url: String, entry: Arc<Cache>) {
        self.cache.insert(url, entry);
        self.sweep_start();
    }

    /// Start the expiry sweep unless it is already running. The sweep stops
    /// itself once the cache drains empty.
    fn sweep_start(self: &Arc<Self>) {
        let mut sweep = self.sweep.lock();
        if sweep.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *sweep = Some(token.clone());
        drop(sweep);

        debug!(id = %self.id, "cache sweep started");
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.cache_cleanup_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        this.cache.retain(|url, entry| {
                            let keep = !entry.expired();
                            if !keep {
                                debug!(id = %this.id, url, "cache sweep removed expired");
                            }
                            keep
                        });

                        // stop once empty; checked under the sweep lock so a
                        // concurrent insert either sees us running or starts
                        // a fresh sweep
                        let mut sweep = this.sweep.lock();
                        if this.cache.is_empty() && !token.is_cancelled() {
                            *sweep = None;
                            debug!(id = %this.id, "cache sweep stopped");
                            break;
                        }
                    }
                }
            }
        });
    }

    fn respond(entry: &Arc<Cache>, content_type: &str) -> Result<Response, ApiError> {
        let body = Body::from_stream(entry.stream().map(Ok::<_, std::convert::Infallible>));
        Response::builder()
            .header("Content-Type", content_type)
            .body(body)
            .map_err(|e| ApiError::internal(e.to_string()))
    }

    /// Serve a playlist: cache hit, or fetch + URL rewrite + cache.
    pub async fn serve_playlist(
        self: &Arc<Self>,
        request_path: &str,
    ) -> Result<Response, ApiError> {
        let url = Self::upstream_url(
            &self.config.playlist_base_url,
            &self.config.playlist_path_prefix,
            request_path,
        );

        if let Some(entry) = self.cached(&url) {
            return Self::respond(&entry, PLAYLIST_CONTENT_TYPE);
        }

        let response = self.client.get(&url).send().await.map_err(|err| {
            warn!(id = %self.id, url, %err, "unable to get upstream playlist");
            ApiError::internal("upstream request failed")
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(id = %self.id, url, %status, "invalid upstream response");
            return Err(ApiError::bad_gateway("invalid upstream response"));
        }

        let body = response.text().await.map_err(|err| {
            warn!(id = %self.id, url, %err, "unable to read upstream body");
            ApiError::internal("upstream read failed")
        })?;

        let base = self.config.playlist_base_url.clone();
        let prefix = self.config.playlist_path_prefix.clone();
        let rewritten = playlist_url_walk(&body, &|u| relative_path(&base, &prefix, u));

        let entry = Cache::new(self.config.playlist_expiration);
        let _ = entry.write(rewritten.as_bytes());
        entry.close();
        self.insert(url, entry.clone());

        Self::respond(&entry, PLAYLIST_CONTENT_TYPE)
    }

    /// Serve a segment: cache hit, or fetch streamed into a fresh cache.
    pub async fn serve_segment(
        self: &Arc<Self>,
        request_path: &str,
    ) -> Result<Response, ApiError> {
        let url = Self::upstream_url(
            &self.config.segment_base_url,
            &self.config.segment_path_prefix,
            request_path,
        );

        if let Some(entry) = self.cached(&url) {
            return Self::respond(&entry, SEGMENT_CONTENT_TYPE);
        }

        let response = self.client.get(&url).send().await.map_err(|err| {
            warn!(id = %self.id, url, %err, "unable to get upstream segment");
            ApiError::internal("upstream request failed")
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(id = %self.id, url, %status, "invalid upstream response");
            return Err(ApiError::bad_gateway("invalid upstream response"));
        }

        let entry = Cache::new(self.config.segment_expiration);
        self.insert(url.clone(), entry.clone());

        // pipe the upstream body into the cache; readers follow live
        tokio::spawn({
            let id = self.id.clone();
            let entry = entry.clone();
            async move {
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(chunk) => {
                            if entry.push(chunk).is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(id = %id, url, %err, "error while copying upstream body");
                            break;
                        }
                    }
                }
                entry.close();
            }
        });

        Self::respond(&entry, SEGMENT_CONTENT_TYPE)
    }
}
