//! repolens-ai - Repository ingestion and analysis service
//!
//! Fetches repository activity from GitHub, runs the insight analyzers over
//! it and serves the results over HTTP REST + SSE.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use repolens_ai::config::{resolve_github_token, ServiceConfig, ROOT_FOLDER_ENV};
use repolens_ai::services::{GithubApi, Scheduler};
use repolens_ai::{AppState, SERVICE_NAME};
use repolens_common::config::{
    default_config_path, load_toml_config, resolve_root_folder, write_toml_config,
};

/// Command-line arguments for repolens-ai
#[derive(Parser, Debug)]
#[command(name = "repolens-ai")]
#[command(about = "Repository ingestion and analysis service")]
#[command(version)]
struct Args {
    /// TOML config file
    #[arg(short, long, env = "REPOLENS_CONFIG")]
    config: Option<PathBuf>,

    /// Folder holding the service database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Listen address, overrides `server.bind`
    #[arg(short, long, env = "REPOLENS_BIND")]
    bind: Option<String>,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args
        .config
        .clone()
        .or_else(|| default_config_path(SERVICE_NAME));
    let config: ServiceConfig = match &config_path {
        Some(path) => load_toml_config(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ServiceConfig::default(),
    };

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config.validate().context("Invalid configuration")?;

    if args.init_config {
        let path = config_path.clone().context("No config path; pass --config")?;
        write_toml_config(&config, &path)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    info!("Starting {} (repository analysis) service", SERVICE_NAME);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config_path {
        info!("Config: {}", path.display());
    }

    // Root folder: CLI → ENV → TOML → default
    let root_folder = resolve_root_folder(
        args.root_folder.as_deref(),
        ROOT_FOLDER_ENV,
        config.root_folder.as_deref(),
    );
    let db_path = root_folder.join(format!("{}.db", SERVICE_NAME));
    info!("Database: {}", db_path.display());

    let db_pool = repolens_ai::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;
    info!("Database connection established");

    let token = resolve_github_token(&config.github);
    let api = GithubApi::new(&config.github, token).context("Failed to build GitHub client")?;

    let bind = args.bind.clone().unwrap_or_else(|| config.server.bind.clone());
    let schedule = config.schedule.clone();
    let state = AppState::new(db_pool.clone(), config, Arc::new(api));

    state
        .orchestrator
        .recover_interrupted_jobs()
        .await
        .context("Failed to recover interrupted jobs")?;

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::from_config(db_pool, state.orchestrator.clone(), &schedule)
        .map(|s| s.spawn(shutdown.clone()));
    if scheduler.is_none() {
        info!("Scheduled analysis disabled");
    }

    let app = repolens_ai::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("Server error")?;

    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM, then cancels `shutdown`
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
