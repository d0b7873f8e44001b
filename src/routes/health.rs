use axum::{extract::State, Json};

use crate::AppState;

/// GET /health — liveness plus cache counters.
pub async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cache = state.cache.stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "cache": cache,
    }))
}
