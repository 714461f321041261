//! tsgate - On-demand HTTP-to-HLS transcoding gateway.
//!
//! Clients request standard HLS URLs; the server spawns ffmpeg/ffprobe for
//! the requested source and profile, streams MPEG-TS segments back, and
//! reclaims transcoders when clients go idle.

use clap::Parser;
use tracing::info;

use tsgate::api::Server;
use tsgate::config::{Cli, Config};
use tsgate::logging::init_logging;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // environment variables may feed clap `env` fallbacks
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.debug);

    info!("starting tsgate v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli)?;
    let bind = config
        .bind
        .clone()
        .expect("bind is validated during config load");

    let server = Server::new(config);
    let router = server.router();

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    server.shutdown().await;
    info!("tsgate shutdown complete");
    Ok(())
}

/// Resolve on SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, initiating shutdown");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    sigterm.recv().await;
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    // no SIGTERM on Windows; ctrl_c above covers shutdown
    std::future::pending::<()>().await;
}
