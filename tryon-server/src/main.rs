//! Try-on server - HTTP front end for the try-on generation pipeline.

use std::env;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tryon_server::pipeline::HttpPipeline;
use tryon_server::{api, logging, AppState, Config};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    println!("tryon-server {}", VERSION);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }

    // Load configuration
    let config = Config::load().map_err(|e| {
        format!(
            "Failed to load configuration: {}. \
             Check config.toml (or the file named by TRYON_CONFIG) and TRYON__* environment variables.",
            e
        )
    })?;

    logging::init_logging(&config.logging.level, config.logging.dir.as_deref().map(Path::new))?;
    tracing::info!(
        version = VERSION,
        environment = %config.server.environment,
        devices = ?config.accelerator.devices,
        "Starting tryon-server"
    );

    let backend = Arc::new(HttpPipeline::new(&config.pipeline.backend_url));
    tracing::info!("Using pipeline backend at {}", config.pipeline.backend_url);

    let state = Arc::new(AppState::new(config.clone(), backend)?);
    state.spawn_background_tasks();

    let app = api::app(state.clone());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down, unloading models");
    state.models.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
