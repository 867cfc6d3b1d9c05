//! Build API Handlers
//!
//! HTTP endpoints for submitting and inspecting builds.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use kiln_core::domain::build::Build;
use kiln_core::dto::build::{BuildSummary, CreateBuild};

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

const MAX_NAME_LEN: usize = 200;

/// POST /builds
/// Create a new build; it is queued for the controller immediately
pub async fn create_build(
    State(state): State<AppState>,
    Json(req): Json<CreateBuild>,
) -> ApiResult<(StatusCode, Json<Build>)> {
    tracing::info!("Creating build: {}", req.name);

    validate_name(&req.name)?;
    if let Some(namespace) = req.namespace.as_deref().filter(|ns| !ns.trim().is_empty()) {
        validate_name(namespace)?;
    }

    let build = state
        .store
        .create(req.into_build(&state.namespace))
        .await?;

    Ok((StatusCode::CREATED, Json(build)))
}

/// GET /builds
/// List all builds
pub async fn list_builds(State(state): State<AppState>) -> Json<Vec<BuildSummary>> {
    tracing::debug!("Listing all builds");

    let builds = state.store.list().await;
    Json(builds.into_iter().map(BuildSummary::from).collect())
}

/// GET /builds/{namespace}/{name}
/// Get build details
pub async fn get_build(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> ApiResult<Json<Build>> {
    tracing::debug!("Getting build: {}/{}", namespace, name);

    state
        .store
        .get(&namespace, &name)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Build {}/{} not found", namespace, name)))
}

// =============================================================================
// Validation
// =============================================================================

fn validate_name(name: &str) -> ApiResult<()> {
    if name.is_empty() {
        return Err(ApiError::BadRequest("Name must not be empty".to_string()));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(ApiError::BadRequest(format!(
            "Name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }

    let valid = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(ApiError::BadRequest(format!(
            "Invalid name '{}': use letters, digits, '-' and '_'",
            name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("dataBuild").is_ok());
        assert!(validate_name("ruby-app_2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("dotted.name").is_err());
        assert!(validate_name(&"x".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
