//! Server initialization
//!
//! Contains the main `run()` function that wires the hub into the HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::Extension;
use axum::routing::get;
use blockgraph_collab::Hub;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::config::AppConfig;
use super::routes;

/// Run the server
pub async fn run(config: AppConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting blockgraph collaboration server"
    );

    let hub = Arc::new(Hub::new(config.hub.clone()));
    let sweep_cancel = CancellationToken::new();
    let sweep = hub.spawn_idle_eviction(sweep_cancel.clone());
    match config.hub.idle_eviction_secs {
        Some(secs) => info!(idle_secs = secs, "Idle room eviction enabled"),
        None => info!("Rooms are retained until shutdown"),
    }

    let app = routes::router()
        .route("/", get(|| async { "Blockgraph collaboration server" }))
        .layer(Extension(Arc::clone(&hub)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config
        .server
        .address()
        .parse()
        .context("Invalid server address")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    sweep_cancel.cancel();
    if let Some(handle) = sweep {
        if let Err(e) = handle.await {
            warn!("Idle sweep task error: {}", e);
        }
    }

    hub.shutdown().await;
    info!("Blockgraph shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
