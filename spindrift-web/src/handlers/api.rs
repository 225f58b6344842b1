//! JSON API endpoints.

use axum::Json;
use axum::extract::State;
use spindrift_core::EngineStats;

use crate::server::AppState;

/// Returns engine counters: peers, progress, resyncs, playback position.
pub async fn api_stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.engine.stats())
}
