use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slipway::config::Config;
use slipway::engine::DeploymentEngine;
use slipway::proxy::ProxyServer;
use slipway::AppState;

#[derive(Parser, Debug)]
#[command(name = "slipway")]
#[command(author, version, about = "A small self-hosted deployment engine", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "slipway.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Slipway v{}", env!("CARGO_PKG_VERSION"));

    std::fs::create_dir_all(&config.server.data_dir)?;

    let db = slipway::db::init(&config.server.data_dir).await?;

    let runtime = slipway::runtime::connect(&config.runtime).await;

    let (deploy_tx, deploy_rx) = mpsc::channel(100);

    let config = Arc::new(config);
    let state = Arc::new(AppState::new(
        config.clone(),
        db.clone(),
        deploy_tx,
        runtime.clone(),
    ));

    let engine = DeploymentEngine::new(db.clone(), runtime, config.clone(), deploy_rx);
    tokio::spawn(async move {
        engine.run().await;
    });

    let proxy_addr: SocketAddr =
        format!("{}:{}", config.server.host, config.server.proxy_port).parse()?;
    let proxy_server = ProxyServer::new(proxy_addr, db.clone(), config.clone());
    tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            tracing::error!(error = %e, "Proxy server error");
        }
    });

    let app = slipway::api::create_router(state);

    let api_addr = format!("{}:{}", config.server.host, config.server.api_port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;

    tracing::info!("API server listening on http://{}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
