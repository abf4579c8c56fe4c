//! HTTP front end of the bridge.
//!
//! ```bash
//! curl -X POST http://127.0.0.1:8801/recognize \
//!      -H 'Content-Type: application/json' \
//!      -d '{"filePath": "/tmp/a.wav"}'
//! ```

pub mod error;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};
use crate::orchestrator::RecognitionService;

pub fn build_router(service: RecognitionService) -> Router {
    Router::new()
        .route("/recognize", post(handlers::recognize))
        .route("/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Bind `address` and serve until Ctrl-C, then stop the worker.
pub async fn run_server(address: &str, service: RecognitionService) -> Result<()> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(|e| Error::Server(format!("failed to bind {}: {}", address, e)))?;

    serve(listener, service, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` completes
pub async fn serve<F>(
    listener: TcpListener,
    service: RecognitionService,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr()?;
    info!("whisper-bridge listening at http://{}", address);

    axum::serve(listener, build_router(service.clone()))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped, shutting down whisper worker");
    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
