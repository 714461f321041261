//! HLS proxying.
//!
//! Serves upstream HLS through this server: playlists are fetched, their
//! URLs rewritten to point back under the proxy path prefix, and both
//! playlists and segments are cached in broadcast caches so that many
//! concurrent clients share a single in-flight upstream fetch.

mod manager;
mod rewrite;

use std::time::Duration;

pub use manager::Manager;
pub use rewrite::{playlist_url_walk, relative_path};

/// Proxy manager configuration for one upstream source.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream base for playlist requests. Trailing slash.
    pub playlist_base_url: String,
    /// Local path prefix stripped from playlist requests. Trailing slash.
    pub playlist_path_prefix: String,
    /// Upstream base for segment requests. Trailing slash.
    pub segment_base_url: String,
    /// Local path prefix stripped from segment requests. Trailing slash.
    pub segment_path_prefix: String,

    pub playlist_expiration: Duration,
    pub segment_expiration: Duration,
    pub cache_cleanup_period: Duration,
}

fn with_trailing_slash(s: &str) -> String {
    let mut s = s.trim_end_matches('/').to_string();
    s.push('/');
    s
}

impl Config {
    /// Playlists and segments share the upstream base and local prefix.
    pub fn new(base_url: &str, path_prefix: &str) -> Self {
        let base_url = with_trailing_slash(base_url);
        let path_prefix = with_trailing_slash(path_prefix);
        Self {
            playlist_base_url: base_url.clone(),
            playlist_path_prefix: path_prefix.clone(),
            segment_base_url: base_url,
            segment_path_prefix: path_prefix,
            playlist_expiration: Duration::from_secs(1),
            segment_expiration: Duration::from_secs(60),
            cache_cleanup_period: Duration::from_secs(4),
        }
    }
}
