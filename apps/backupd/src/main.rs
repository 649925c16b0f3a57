//! dbfetch backup agent entry point.

mod app;
mod config;
mod handler;

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Produces database backups on request and streams them to clients.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (created with defaults if missing).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the configured listening port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured storage directory.
    #[arg(long, value_name = "DIR")]
    storage_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting dbfetch agent"
    );

    let path = cli.config.unwrap_or_else(config::default_config_path);
    let mut config = config::Config::load(&path)?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }
    tracing::info!(path = %path.display(), port = config.port, "configuration loaded");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, CancellationToken::new()))?;

    tracing::info!("agent shut down cleanly");
    Ok(())
}
