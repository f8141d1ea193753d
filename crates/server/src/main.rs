//! Virtual registry server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vreg_core::config::AppConfig;
use vreg_server::cleanup::spawn_scheduler;
use vreg_server::{AppState, HttpUpstreamClient, create_router};

/// vreg - a pull-through cache for Maven, npm and container registries
#[derive(Parser, Debug)]
#[command(name = "vregd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "VREG_CONFIG", default_value = "config.toml")]
    config: String,
}

/// Load configuration from an optional TOML file overlaid with `VREG_*`
/// environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("VREG_") && key != "VREG_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: vregd --config /path/to/config.toml\n  \
             2. Environment variables: VREG_SERVER__BIND=0.0.0.0:8080 \
             VREG_STORAGE__TYPE=filesystem VREG_STORAGE__PATH=/var/lib/vreg vregd\n\n\
             Set VREG_CONFIG to change the default config file path."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("VREG_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vreg_server=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("vreg v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    vreg_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = vreg_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    storage
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = storage.backend_name(), "Storage backend ready");

    let metadata = vreg_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let client =
        HttpUpstreamClient::new(&config.fetch).context("failed to build upstream HTTP client")?;

    let features = config.features;
    let bind = config.server.bind.clone();
    let state = AppState::new(config, storage, metadata, Arc::new(client))
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    // Runs left `running` by a previous process would otherwise block their
    // policy forever.
    state
        .cleanup
        .recover_orphans()
        .await
        .context("failed to recover orphaned cleanup runs")?;

    if features.cleanup_scheduler {
        spawn_scheduler(state.cleanup.clone());
    } else {
        tracing::info!("Cleanup scheduler disabled");
    }
    if features.blob_gc_worker {
        state.blob_gc.clone().spawn();
    } else {
        tracing::info!("Blob deletion worker disabled");
    }

    let app = create_router(state);

    let addr: SocketAddr = bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
