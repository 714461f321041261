//! Live HLS manager.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use axum::response::Response;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::error::ApiError;
use crate::error::{Error, Result};
use crate::utils::Latch;

use super::{CmdFactory, Config, Events};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

struct Run {
    id: u64,
    pid: u32,
    dir: PathBuf,
    token: CancellationToken,
    active_latch: Latch,
}

#[derive(Default)]
struct State {
    run: Option<Run>,
    run_seq: u64,
    active: bool,
    sequence: u32,
    playlist: String,
}

/// One live transcoder per manager instance.
///
/// The transcoder is started by the first playlist request, kept alive while
/// requests keep coming, and reaped after an idle period. Stopping kills the
/// whole process group and removes the temp segment directory; the next
/// request starts a fresh instance.
pub struct Manager {
    id: String,
    config: Config,
    cmd_factory: CmdFactory,
    events: Events,
    state: Mutex<State>,
    last_request: Mutex<Instant>,
}

impl Manager {
    pub fn new(id: impl Into<String>, cmd_factory: CmdFactory, config: Config) -> Self {
        Self {
            id: id.into(),
            config,
            cmd_factory,
            events: Events::default(),
            state: Mutex::new(State::default()),
            last_request: Mutex::new(Instant::now()),
        }
    }

    pub fn with_events(mut self, events: Events) -> Self {
        self.events = events;
        self
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().run.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Spawn the transcoder and its reader/waiter/reaper tasks.
    ///
    /// Returns as soon as the child is spawned; the manager becomes active
    /// asynchronously once enough playlist updates arrived.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.run.is_some() {
            return Err(Error::transcoder("has already started"));
        }

        debug!(id = %self.id, "performing start");

        let dir = tempfile::Builder::new()
            .prefix("tsgate-live-")
            .tempdir()
            .map_err(Error::Io)?;

        let mut cmd = (self.cmd_factory)();
        cmd.current_dir(dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::transcoder(format!("unable to spawn transcoder: {e}")))?;

        let pid = child.id().unwrap_or_default();
        let token = CancellationToken::new();
        let active_latch = Latch::new();

        state.run_seq += 1;
        let run_id = state.run_seq;
        state.run = Some(Run {
            id: run_id,
            pid,
            dir: dir.path().to_path_buf(),
            token: token.clone(),
            active_latch: active_latch.clone(),
        });
        state.active = false;
        state.sequence = 0;
        state.playlist.clear();
        drop(state);

        *self.last_request.lock() = Instant::now();

        info!(id = %self.id, pid, "transcode started");
        if let Some(on_start) = &self.events.on_start {
            on_start();
        }

        // stderr is the transcoder log
        if let Some(stderr) = child.stderr.take() {
            let this = self.clone();
            process_utils::log_lines(
                stderr,
                "hlslive",
                Some(Box::new(move |line: &str| {
                    if let Some(on_cmd_log) = &this.events.on_cmd_log {
                        on_cmd_log(line);
                    }
                })),
            );
        }

        // stdout carries playlist updates
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::transcoder("transcoder has no stdout"))?;
        tokio::spawn({
            let this = self.clone();
            let token = token.clone();
            let active_latch = active_latch.clone();
            let mut stdout = stdout;
            async move {
                let mut buf = [0u8; 1024];
                loop {
                    let read = tokio::select! {
                        _ = token.cancelled() => break,
                        read = stdout.read(&mut buf) => read,
                    };
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let mut state = this.state.lock();
                            if state.run.as_ref().map(|r| r.id) != Some(run_id) {
                                break;
                            }
                            state.playlist = String::from_utf8_lossy(&buf[..n]).into_owned();
                            state.sequence += 1;
                            debug!(
                                id = %this.id,
                                sequence = state.sequence,
                                "received playlist"
                            );
                            if state.sequence == this.config.hls_minimum_segments {
                                state.active = true;
                                active_latch.release();
                            }
                        }
                        Err(err) => {
                            warn!(id = %this.id, %err, "transcoder stdout read failed");
                            break;
                        }
                    }
                }
            }
        });

        // waiter owns the child and the temp dir; it runs the exit handler
        tokio::spawn({
            let this = self.clone();
            let token = token.clone();
            async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = token.cancelled() => {
                        process_utils::kill_tree(pid).await;
                        child.wait().await
                    }
                };

                let code = match &status {
                    Ok(status) => {
                        if !status.success() {
                            warn!(id = %this.id, %status, "transcoder exited");
                        }
                        status.code()
                    }
                    Err(err) => {
                        warn!(id = %this.id, %err, "error waiting for transcoder");
                        None
                    }
                };

                {
                    let mut state = this.state.lock();
                    if state.run.as_ref().map(|r| r.id) == Some(run_id) {
                        state.run = None;
                        state.active = false;
                    }
                }
                token.cancel();
                drop(dir);

                info!(id = %this.id, "transcode stopped");
                if let Some(on_stop) = &this.events.on_stop {
                    on_stop(code);
                }
            }
        });

        // idle reaper
        tokio::spawn({
            let this = self.clone();
            let token = token.clone();
            let period = self.config.cleanup_period;
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => this.cleanup().await,
                    }
                }
            }
        });

        Ok(())
    }

    /// Kill the process group. The waiter task finishes the teardown.
    pub async fn stop(&self) {
        let token = {
            let state = self.state.lock();
            match &state.run {
                Some(run) => run.token.clone(),
                None => return,
            }
        };
        debug!(id = %self.id, "performing stop");
        token.cancel();
    }

    /// Stop the transcoder when no request arrived for the idle cutoff.
    async fn cleanup(&self) {
        let diff = self.last_request.lock().elapsed();
        let active = self.state.lock().active;
        let stop = active && diff > self.config.active_idle_timeout
            || !active && diff > self.config.inactive_idle_timeout;

        debug!(
            id = %self.id,
            diff_secs = diff.as_secs(),
            active,
            stop,
            "performing cleanup"
        );

        if stop {
            self.stop().await;
        }
    }

    /// Serve the current playlist, starting the transcoder when needed and
    /// blocking until the stream is active.
    pub async fn serve_playlist(self: &Arc<Self>) -> std::result::Result<Response, ApiError> {
        *self.last_request.lock() = Instant::now();

        let run = {
            let state = self.state.lock();
            state
                .run
                .as_ref()
                .map(|r| (r.token.clone(), r.active_latch.clone()))
        };
        let (token, active_latch) = match run {
            Some(run) => run,
            None => {
                // a concurrent request may have won the start race
                if let Err(err) = self.start()
                    && !self.is_started()
                {
                    warn!(id = %self.id, %err, "transcode could not be started");
                    return Err(ApiError::internal(err.to_string()));
                }
                let state = self.state.lock();
                let run = state
                    .run
                    .as_ref()
                    .ok_or_else(|| ApiError::internal("transcode stopped during start"))?;
                (run.token.clone(), run.active_latch.clone())
            }
        };

        let playlist = {
            let state = self.state.lock();
            if state.active {
                Some(state.playlist.clone())
            } else {
                None
            }
        };

        let playlist = match playlist {
            Some(playlist) => playlist,
            None => {
                tokio::select! {
                    _ = active_latch.wait() => self.state.lock().playlist.clone(),
                    _ = token.cancelled() => {
                        warn!(id = %self.id, "stream stopped before becoming active");
                        return Err(ApiError::internal("stream not available"));
                    }
                    _ = tokio::time::sleep(self.config.playlist_timeout) => {
                        warn!(id = %self.id, "playlist load timeouted");
                        return Err(ApiError::gateway_timeout("playlist timeout"));
                    }
                }
            }
        };

        Response::builder()
            .header("Content-Type", PLAYLIST_CONTENT_TYPE)
            .header("Cache-Control", "no-cache")
            .body(playlist.into())
            .map_err(|e| ApiError::internal(e.to_string()))
    }

    /// Serve a segment file from the temp directory.
    ///
    /// Does not auto-start: only playlist requests may start the transcoder.
    pub async fn serve_media(&self, file_name: &str) -> std::result::Result<Response, ApiError> {
        let dir = {
            let state = self.state.lock();
            state.run.as_ref().map(|r| r.dir.clone())
        };
        let Some(dir) = dir else {
            return Err(ApiError::not_found("media not found"));
        };

        let path = dir.join(file_name);
        let response = crate::utils::serve_file(&path, "video/MP2T", true).await?;

        *self.last_request.lock() = Instant::now();
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh_manager(script: &str, config: Config) -> Arc<Manager> {
        let script = script.to_string();
        let factory: CmdFactory = Arc::new(move || {
            let mut cmd = process_utils::group_command("sh");
            cmd.args(["-c", &script]);
            cmd
        });
        Arc::new(Manager::new("test/stream", factory, config))
    }

    #[tokio::test]
    async fn cold_start_serves_after_minimum_updates() {
        // two playlist updates, then hold the pipe open
        let manager = sh_manager(
            "printf one; sleep 0.2; printf two; sleep 30",
            Config {
                playlist_timeout: Duration::from_secs(5),
                ..Config::default()
            },
        );

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve_playlist().await })
        };
        let second = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.serve_playlist().await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.status(), 200);
        assert_eq!(second.status(), 200);
        assert!(manager.is_active());

        manager.stop().await;
    }

    #[tokio::test]
    async fn playlist_times_out_without_updates() {
        let manager = sh_manager(
            "sleep 30",
            Config {
                playlist_timeout: Duration::from_millis(100),
                ..Config::default()
            },
        );

        let err = manager.serve_playlist().await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::GATEWAY_TIMEOUT);

        manager.stop().await;
    }

    #[tokio::test]
    async fn spawn_failure_leaves_manager_unstarted() {
        let factory: CmdFactory =
            Arc::new(|| process_utils::group_command("/nonexistent/transcoder"));
        let manager = Arc::new(Manager::new("test/bad", factory, Config::default()));

        let err = manager.serve_playlist().await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!manager.is_started());
    }

    #[tokio::test]
    async fn media_is_not_served_after_stop() {
        let manager = sh_manager("printf one; printf two; sleep 30", Config::default());
        manager.start().unwrap();

        // write a segment file into the temp dir
        let dir = {
            let state = manager.state.lock();
            state.run.as_ref().unwrap().dir.clone()
        };
        tokio::fs::write(dir.join("0001.ts"), b"segment").await.unwrap();
        assert_eq!(manager.serve_media("0001.ts").await.unwrap().status(), 200);

        manager.stop().await;
        // wait for the waiter task to tear the run down
        for _ in 0..100 {
            if !manager.is_started() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let err = manager.serve_media("0001.ts").await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::NOT_FOUND);
    }
}
