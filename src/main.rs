//! rozd - game server identity daemon

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use rozd::config::Config;
use rozd::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rozd", about = "Game server identity and authorization daemon")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rozd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    info!("Data directory: {}", config.data_dir.display());

    let server = Server::new(config);
    server.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.save_all().await;
    info!("rozd shutdown complete");

    Ok(())
}
