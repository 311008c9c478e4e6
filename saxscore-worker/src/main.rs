//! saxscore-worker - Saxophone transcription service
//!
//! Accepts audio uploads over HTTP, runs each job through separation,
//! detection and export on a single background worker, and serves the
//! resulting notation artifacts.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use saxscore_common::config::{self, BackendKind, TomlConfig};
use saxscore_common::events::EventBus;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use saxscore_worker::config::{build_backend, WorkerSettings, DEFAULT_PORT};
use saxscore_worker::pipeline::Orchestrator;
use saxscore_worker::queue::JobQueue;
use saxscore_worker::transpose::Transposer;
use saxscore_worker::worker::{self, Worker};
use saxscore_worker::AppState;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    Process,
    Stub,
}

/// Command-line arguments for saxscore-worker
#[derive(Parser, Debug)]
#[command(name = "saxscore-worker")]
#[command(about = "Saxophone audio-to-notation transcription service")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "SAXSCORE_PORT")]
    port: Option<u16>,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1", env = "SAXSCORE_BIND")]
    bind: IpAddr,

    /// Root folder holding the database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// TOML config file
    #[arg(short, long, env = "SAXSCORE_CONFIG")]
    config: Option<PathBuf>,

    /// Analysis backend (overrides the config file)
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut toml_config = TomlConfig::load_or_default(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(backend) = args.backend {
        toml_config.backend.kind = match backend {
            BackendArg::Process => BackendKind::Process,
            BackendArg::Stub => BackendKind::Stub,
        };
    }

    // Initialize tracing
    let level = toml_config.logging.level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("saxscore_worker={level},saxscore_common={level},tower_http=info").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting saxscore-worker {}", env!("CARGO_PKG_VERSION"));

    // Resolve root folder and open the database
    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), config::ROOT_FOLDER_ENV, Some(&toml_config));
    let db_path = config::prepare_root_folder(&root_folder)?;
    info!("Database: {}", db_path.display());

    let db_pool = saxscore_common::db::init_database_pool(&db_path)
        .await
        .context("Failed to open database")?;

    let settings = WorkerSettings::from_toml(&toml_config);
    let event_bus = EventBus::new(settings.event_capacity);
    let queue = Arc::new(JobQueue::new());
    let backend = build_backend(&toml_config.backend, None);

    // Pick up where a previous process left off
    worker::recover(&db_pool, &queue, &event_bus)
        .await
        .context("Failed to recover jobs")?;

    let orchestrator = Orchestrator::new(
        db_pool.clone(),
        Arc::clone(&backend),
        event_bus.clone(),
        settings.pipeline.clone(),
    );
    let worker_handle = Worker::new(db_pool.clone(), Arc::clone(&queue), event_bus.clone(), orchestrator)
        .with_idle_interval(settings.idle_interval)
        .spawn();

    let transposer = Transposer::new(db_pool.clone(), backend, event_bus.clone())
        .with_timeout(settings.pipeline.stage_timeout);
    let state = AppState::new(db_pool, queue, event_bus, transposer).with_max_upload_bytes(settings.max_upload_bytes);
    let app = saxscore_worker::build_router(state);

    let port = args.port.or(toml_config.port).unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::new(args.bind, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("HTTP server stopped, waiting for worker");
    worker_handle.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
