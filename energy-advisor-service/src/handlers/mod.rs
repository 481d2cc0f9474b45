//! HTTP handlers for the energy advisor service.

pub mod chat;
pub mod health;
pub mod metrics;

pub use chat::chat;
pub use health::{health_check, liveness, readiness_check};

use axum::http::Uri;
use service_core::error::AppError;

/// Fallback for unknown routes.
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(anyhow::anyhow!("No route for {}", uri.path()))
}
