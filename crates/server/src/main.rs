//! stowage server binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_server::disks::DiskSet;
use stowage_server::users::UserService;
use stowage_server::{AppState, bootstrap, create_router};
use stowage_storage::FsSpaceProbe;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// stowage - multi-user cloud storage core
#[derive(Parser, Debug)]
#[command(name = "stowaged")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "STOWAGE_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server (default)
    Serve,
    /// Create a user in the default group
    CreateUser {
        username: String,
        /// Quota in bytes; omit for the default group's space
        #[arg(long)]
        space: Option<u64>,
    },
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

    tracing::info!("stowage v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args.config)?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")?;

    let metadata = stowage_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    bootstrap::ensure_default_group(metadata.as_ref()).await?;

    match args.command.unwrap_or(Command::Serve) {
        Command::CreateUser { username, space } => {
            let user = UserService::new(metadata.clone())
                .create_user(&username, space)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("{}", user.user_id);
            Ok(())
        }
        Command::Serve => serve(config, metadata).await,
    }
}

/// File is optional; `STOWAGE_<SECTION>__<KEY>` variables override it.
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
        std::env::vars().any(|(key, _)| key.starts_with("STOWAGE_") && key != "STOWAGE_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: stowaged --config /path/to/config.toml\n  \
             2. Environment variables: STOWAGE_SERVER__BIND=0.0.0.0:8080 \
             STOWAGE_SERVER__GATEWAY_TOKEN_HASH=YOUR_SHA256_HEX stowaged\n\n\
             Set STOWAGE_CONFIG to change the default config file path."
        );
    }

    figment
        .merge(Env::prefixed("STOWAGE_").split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn serve(config: AppConfig, metadata: Arc<dyn stowage_metadata::MetadataStore>) -> Result<()> {
    stowage_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let specs = bootstrap::register_disks(metadata.as_ref(), &config).await?;
    let disks = Arc::new(
        DiskSet::new(specs, Arc::new(FsSpaceProbe), &config.file.temp_dir)
            .context("failed to open disks")?,
    );

    let paused = bootstrap::recover(metadata.as_ref()).await?;
    if paused > 0 {
        tracing::info!(paused, "Interrupted downloads paused");
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(config.clone(), metadata, disks)?;

    let _watchdog = state.jobs.clone().spawn_watchdog(shutdown.clone());
    if config.scheduler.enabled {
        let _scheduler = state.scheduler.clone().spawn(shutdown.clone());
        tracing::info!(
            interval_secs = config.scheduler.interval_secs,
            "Lifecycle scheduler spawned"
        );
    } else {
        tracing::info!("Lifecycle scheduler disabled");
    }

    let supervisor = state.downloads.supervisor().clone();
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Running downloads stay `downloading`; the next start pauses them.
    supervisor.cancel_all();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
    tracing::info!("Shutdown signal received");
    shutdown.cancel();
}
