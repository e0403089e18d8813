//! Restreamer entry point

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use restreamer::logging::{AccessLog, ConsoleLog, FileLog};
use restreamer::server::{build_router, Config, StreamContext};

#[derive(Parser)]
#[command(name = "restreamer")]
#[command(about = "Live MPEG-TS restreamer")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(default_value = "server.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("restreamer=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config).map_err(|err| {
        tracing::error!(path = %cli.config.display(), error = %err, "cannot load configuration");
        err
    })?;

    let log: Arc<dyn AccessLog> = match &config.log {
        Some(path) => Arc::new(FileLog::create(path).await?),
        None => Arc::new(ConsoleLog),
    };

    let mut streams = Vec::new();
    for stream in &config.streams {
        tracing::info!(serve = %stream.serve, remote = ?stream.remote.uris(), "starting stream");
        match StreamContext::start(&config, stream, Arc::clone(&log)) {
            Ok(ctx) => streams.push(ctx),
            Err(err) => {
                // a broken stream definition must not take the others down
                tracing::error!(serve = %stream.serve, error = %err, "stream failed to start");
            }
        }
    }
    if streams.is_empty() {
        tracing::error!("no streams available");
        std::process::exit(1);
    }

    let router = build_router(streams.clone(), config.max_connections);
    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(addr = %config.listen, streams = streams.len(), "restreamer listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(streams))
    .await?;

    Ok(())
}

async fn shutdown_signal(streams: Vec<Arc<StreamContext>>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    for ctx in &streams {
        ctx.shutdown();
    }
}
