//! Cycle-Capture Service binary

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::serve;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cyclesrv::api::{create_api_routes, AppState};
use cyclesrv::config::ServiceConfig;
use cyclesrv::core::monitor::MonitorRegistry;
use cyclesrv::core::scan::ScanMatcher;
use cyclesrv::store::{CycleStore, MemoryStore, SqliteStore};

#[derive(Parser, Debug)]
#[command(name = "cyclesrv", about = "PLC monitoring and cycle-capture service")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/cyclesrv.yaml", env = "CYCLESRV_CONFIG")]
    config: String,

    /// Override the API bind address (host:port)
    #[arg(long)]
    bind_address: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    common::logging::init("info,cyclesrv=debug");

    let config = ServiceConfig::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;

    if args.validate {
        info!("Configuration valid: {} station(s)", config.stations.len());
        return Ok(());
    }

    info!(
        "Starting {} with {} configured station(s)",
        config.service.name,
        config.stations.len()
    );

    // Open the record store
    let store: Arc<dyn CycleStore> = if config.store.path == ":memory:" {
        info!("Using in-memory record store");
        Arc::new(MemoryStore::new())
    } else {
        info!("Opening record store at {}", config.store.path);
        Arc::new(
            SqliteStore::open(&config.store.path)
                .await
                .with_context(|| format!("opening record store at {}", config.store.path))?,
        )
    };

    let config = Arc::new(config);
    let registry = Arc::new(MonitorRegistry::new(
        config.stations.clone(),
        Arc::clone(&store),
    ));
    let matcher = Arc::new(ScanMatcher::new(Arc::clone(&store)));

    // Start polling for every station enabled in configuration
    let started = registry.start_configured().await;
    info!("Monitoring started for {started} station(s)");

    let shutdown_token = CancellationToken::new();
    let server_handle = if config.api.enabled {
        let bind_address = args
            .bind_address
            .unwrap_or_else(|| format!("{}:{}", config.api.host, config.api.port));
        let addr: SocketAddr = bind_address
            .parse()
            .with_context(|| format!("invalid bind address '{bind_address}'"))?;

        let state = AppState {
            config: Arc::clone(&config),
            registry: Arc::clone(&registry),
            matcher,
        };
        let app = create_api_routes(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding API server to {addr}"))?;
        info!("API server listening on http://{addr}");

        let token = shutdown_token.clone();
        Some(tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!("API server error: {e}");
            }
        }))
    } else {
        info!("API disabled by configuration");
        None
    };

    common::shutdown::wait_for_shutdown().await;
    info!("Shutdown signal received");

    registry.stop_all().await;
    shutdown_token.cancel();
    if let Some(handle) = server_handle {
        let _ = handle.await;
    }

    info!("Service stopped");
    Ok(())
}
