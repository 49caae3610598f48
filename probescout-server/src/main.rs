//! Scan server - start, poll, stream and stop probescout scans over HTTP.

mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use probescout::io::config::{DEFAULT_CONFIG_FILE, load_config};

use crate::state::{AppState, LiveWorker};

#[derive(Parser)]
#[command(name = "probescout-server", about = "HTTP API for goal-driven nmap scans")]
struct ServerArgs {
    /// Socket address to listen on
    #[arg(long, default_value = "127.0.0.1:3001")]
    listen: SocketAddr,

    /// Config file shared by every scan started through the API
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("probescout=info".parse()?)
        .add_directive("probescout_server=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let ServerArgs { listen, config } = ServerArgs::parse();
    let scout_config = load_config(&config)?;
    info!(
        config = %config.display(),
        dry_run = scout_config.scanner.dry_run,
        "starting probescout-server"
    );

    let app = routes::app(AppState::new(scout_config, Arc::new(LiveWorker)));
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(addr = %listen, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
