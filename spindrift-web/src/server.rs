//! Axum server wiring for the range endpoint and stats API.

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use spindrift_core::StreamEngine;
use tower_http::cors::CorsLayer;

use crate::handlers::{api_stats, stream_file};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Download engine serving the selected file.
    pub engine: StreamEngine,
}

/// Builds the router: the stream at `/` and `/stream`, stats under `/api`.
pub fn router(engine: StreamEngine) -> Router {
    let state = AppState { engine };
    Router::new()
        .route("/", get(stream_file))
        .route("/stream", get(stream_file))
        .route("/api/stats", get(api_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Binds `addr` and serves until the process exits.
///
/// # Errors
///
/// - `std::io::Error` - If the listener cannot bind or the server fails
pub async fn run_server(engine: StreamEngine, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(engine);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("spindrift listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await
}
