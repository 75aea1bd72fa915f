//! MyData uploader entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "MyData uploader - scans a data directory and uploads files missing from the server"
)]
struct Args {
    /// Configuration file (default: ~/.config/mydata/uploader.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run a single cycle and exit instead of following the schedule
    #[arg(long)]
    once: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting MyData uploader");

    let path = match args.config {
        Some(path) => path,
        None => config::config_path()?,
    };
    let config = config::Config::load_from(&path)?;
    tracing::info!(
        path = %path.display(),
        data_directory = %config.data_directory.display(),
        schedule = %config.schedule,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, args.once))?;

    tracing::info!("uploader shut down cleanly");
    Ok(())
}
