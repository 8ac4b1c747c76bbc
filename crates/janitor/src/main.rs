//! Beacon janitor binary.

use anyhow::{Context, Result};
use beacon_core::config::AppConfig;
use beacon_janitor::jobs::{enabled_jobs, recover_orphaned_jobs, run_once, spawn_scheduler};
use beacon_janitor::{CommitGraphSource, GitCli, JanitorState, create_router};
use beacon_metadata::StoreOptions;
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Beacon janitor - upload cleanup and visibility worker
#[derive(Parser, Debug)]
#[command(name = "beacon-janitor")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "BEACON_CONFIG",
        default_value = "config/janitor.toml"
    )]
    config: String,

    /// Run every enabled job once and exit
    #[arg(long)]
    once: bool,
}

/// Load configuration from an optional TOML file overlaid with
/// `BEACON_`-prefixed environment variables.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::info!(config_path = %path, "No config file found, using defaults and environment");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("BEACON_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Beacon janitor v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;

    beacon_janitor::metrics::register_metrics();

    let metadata =
        beacon_metadata::from_config(&config.metadata, StoreOptions::from_app_config(&config))
            .await
            .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let recovered = recover_orphaned_jobs(&metadata)
        .await
        .context("failed to recover orphaned janitor jobs")?;
    if recovered > 0 {
        tracing::info!(count = recovered, "Orphaned janitor jobs recovered");
    }

    let git: Arc<dyn CommitGraphSource> = Arc::new(GitCli::from_config(&config.gitserver));
    let state = JanitorState::new(config.clone(), metadata, git);

    if args.once {
        for job_type in enabled_jobs(&config.janitor) {
            match run_once(&state, job_type)
                .await
                .with_context(|| format!("failed to start {job_type} job"))?
            {
                Some(stats) => tracing::info!(job_type = %job_type, stats = ?stats, "Job finished"),
                None => tracing::warn!(job_type = %job_type, "Job skipped or failed"),
            }
        }
        return Ok(());
    }

    let _watchdog_handle = state.job_registry.clone().spawn_watchdog();
    tracing::info!("Janitor task watchdog spawned");

    if config.janitor.enabled {
        spawn_scheduler(state.clone());
        tracing::info!("Janitor scheduler spawned");
    } else {
        tracing::info!("Janitor scheduling disabled");
    }

    let app = create_router(state);
    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await?;

    Ok(())
}
