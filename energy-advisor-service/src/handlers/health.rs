use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use service_core::error::AppError;

/// Plain-text liveness message on `/`.
pub async fn liveness() -> &'static str {
    "Server is live!"
}

/// Health check endpoint for Docker/K8s liveness probes.
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "energy-advisor-service",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness check: the model provider must be reachable.
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, AppError> {
    match state.text_provider.health_check().await {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) => {
            tracing::warn!(
                provider = state.text_provider.name(),
                error = %e,
                "Readiness check failed"
            );
            Err(AppError::ServiceUnavailable)
        }
    }
}
