//! API Module
//!
//! HTTP API layer for the controller.
//! Builds are submitted and inspected here; the controller picks new builds
//! up from the store's queue.

pub mod build;
pub mod error;
pub mod health;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::repository::MemoryBuildStore;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MemoryBuildStore>,
    /// Namespace for builds submitted without one
    pub namespace: String,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Build endpoints
        .route("/builds", post(build::create_build))
        .route("/builds", get(build::list_builds))
        .route("/builds/{namespace}/{name}", get(build::get_build))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
