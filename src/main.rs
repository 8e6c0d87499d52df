use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;

use media_downloader::{
    cleanup::Cleanup,
    config::load_config,
    daemon::{self, PidFile},
    engine::YtDlpEngine,
    events::{LogNotifier, NotificationBus},
    handlers,
    orchestrator::{Orchestrator, OrchestratorSettings},
    persistence::{self, PersistenceMirror, SqlitePersistence, TaskPersistence},
    store::TaskStore,
    strategy::StrategyChain,
    AppState,
};

// --- Command-Line Argument Parsing ---
#[derive(Parser, Debug)]
#[command(author, version, about = "A queued media download service.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manages the server process.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Start the server as a background process.
    Start,
    /// Stop the background server process.
    Stop,
    /// Restart the background server process.
    Restart,
    /// Run the server in the foreground.
    Run,
    /// Check the status of the background server process.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let Commands::Server { action } = &cli.command;
    match action {
        ServerAction::Run => run_server().await?,
        ServerAction::Start => daemon::start(&PidFile::locate()?)?,
        ServerAction::Stop => daemon::stop(&PidFile::locate()?)?,
        ServerAction::Restart => {
            let pid_file = PidFile::locate()?;
            daemon::stop(&pid_file)?;
            tokio::time::sleep(Duration::from_secs(1)).await;
            daemon::start(&pid_file)?;
        }
        ServerAction::Status => daemon::status(&PidFile::locate()?)?,
    }

    Ok(())
}

/// Wires the task pipeline together and serves the HTTP API.
async fn run_server() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config().await?;
    config.validate()?;

    let backend: Arc<dyn TaskPersistence> = Arc::new(SqlitePersistence::open(&config.database_file()?)?);
    let store = Arc::new(TaskStore::new());
    persistence::reconcile(backend.as_ref(), &store, &config.download_dir()).context("loading task history")?;
    let mirror = Arc::new(PersistenceMirror::spawn(backend)?);

    let bus = Arc::new(NotificationBus::new());
    bus.subscribe(Arc::new(LogNotifier));

    let engine = Arc::new(YtDlpEngine::new(config.ytdlp_path.clone()));
    let chain = StrategyChain::new(engine, config.cookies_path());
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorSettings::from_config(&config),
        chain,
        store,
        bus,
        mirror.clone(),
    )?);

    let cleanup = Arc::new(Cleanup::from_config(&config));
    if config.auto_cleanup {
        cleanup
            .clone()
            .spawn_periodic(Duration::from_secs(config.cleanup_interval_secs.max(60)));
    }

    let state = AppState {
        orchestrator: orchestrator.clone(),
        config: Arc::new(config),
        cleanup,
    };

    let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr = format!("{}:{}", host, port);
    let app = Router::new()
        .route("/formats", get(handlers::list_formats))
        .route("/downloads", get(handlers::list_downloads).post(handlers::create_download))
        .route("/downloads/:id", get(handlers::get_download))
        .route("/downloads/:id/cancel", post(handlers::cancel_download))
        .route("/files", get(handlers::list_files))
        .route("/files/*path", get(handlers::get_file))
        .route("/config", get(handlers::get_config))
        .route("/cleanup", post(handlers::run_cleanup))
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
        .with_state(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    orchestrator.shutdown();
    tokio::task::spawn_blocking(move || mirror.flush()).await?;
    Ok(())
}
