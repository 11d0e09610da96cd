//! Courier server binary.

use anyhow::{Context, Result};
use clap::Parser;
use courier_core::config::AppConfig;
use courier_server::{AppState, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Courier - a chunked file sharing server
#[derive(Parser, Debug)]
#[command(name = "courierd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "COURIER_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

/// Merge the optional config file with `COURIER_` environment variables.
///
/// Every setting has a default, so neither source is required.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("COURIER_").split("__").ignore(&["config"]))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Courier v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    if config.server.metrics_enabled {
        courier_server::metrics::register_metrics();
        tracing::info!("Prometheus metrics registered");
    }

    let stores = courier_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    stores
        .artifacts
        .health_check()
        .await
        .context("artifact storage health check failed")?;
    stores
        .chunks
        .health_check()
        .await
        .context("chunk storage health check failed")?;
    tracing::info!(
        files = %config.storage.files_path.display(),
        chunks = %config.storage.chunks_path.display(),
        "Storage initialized"
    );

    let metadata = courier_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    metadata
        .health_check()
        .await
        .context("metadata store health check failed")?;
    tracing::info!(path = %config.metadata.path.display(), "Metadata store initialized");

    let state = AppState::new(config.clone(), stores, metadata);

    let _sweeper = state.spawn_sweeper();
    tracing::info!(
        retention_secs = config.uploads.retention_secs,
        interval_secs = config.uploads.sweep_interval().as_secs(),
        "Upload sweeper spawned"
    );

    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
