//! privagg daemon
//!
//! Opens the repository, installs the data-source registry and runs the
//! lifecycle sweep until interrupted.

use anyhow::Context;
use clap::Parser;
use privagg::{Config, LoggingConfig, QueryLifecycleManager, SqliteRepository};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "privagg")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Privacy-preserving aggregate query daemon")]
struct Args {
    /// Config file (default: standard locations, then environment)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("privagg={}", config.level)));

    let writer = match &config.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    let layer = if config.format == "json" {
        layer.json().boxed()
    } else {
        layer.boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };

    init_logging(&config.logging)?;
    tracing::info!("privagg v{}", env!("CARGO_PKG_VERSION"));

    let path = Path::new(&config.storage.database_path);
    tracing::info!("Database: {:?}", path);
    let repo = SqliteRepository::open(path)
        .with_context(|| format!("opening database {}", path.display()))?;
    let installed = repo.install_data_sources()?;
    if installed > 0 {
        tracing::info!(installed, "Data-source registry installed");
    }

    tracing::info!(
        mode = ?config.privacy.mode,
        sweep_interval_secs = config.lifecycle.sweep_interval_secs,
        max_concurrent_queries = config.lifecycle.max_concurrent_queries,
        "Starting sweep loop"
    );
    let manager = Arc::new(QueryLifecycleManager::new(Arc::new(repo), Arc::new(config)));
    let sweeper = manager.clone().start();

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    manager.stop().await;
    sweeper.abort();

    tracing::info!("privagg shutdown complete");
    Ok(())
}
