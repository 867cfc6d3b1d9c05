//! Health Check API Handler
//!
//! Health check endpoint for monitoring; also reports how many builds the
//! controller currently tracks.

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::api::AppState;

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let builds = state.store.list().await.len();
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "builds": builds })),
    )
}
