use crate::models::EnergyProfileRequest;
use crate::services::metrics;
use crate::services::prompt::build_prompt;
use crate::services::relay::{relay_response, RelayContext};
use crate::startup::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    response::Response,
    Extension, Json,
};
use service_core::error::AppError;
use service_core::middleware::RequestId;
use std::time::Instant;

pub const INCOMPLETE_DATA_MESSAGE: &str = "Incomplete energy data provided";

/// `POST /chat`: validate the profile, open the model stream and relay it.
///
/// Every error returned from here happens before the first body byte, so the
/// status code still reflects it. Failures after that point are handled by
/// the relay.
#[tracing::instrument(skip_all)]
pub async fn chat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    payload: Result<Json<EnergyProfileRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|rejection| {
        metrics::record_chat_request("invalid");
        tracing::warn!(request_id = %request_id, error = %rejection, "Rejected malformed chat body");
        AppError::BadRequest(anyhow::anyhow!(
            "Invalid request body: {}",
            rejection.body_text()
        ))
    })?;

    let profile = request.into_profile().map_err(|errors| {
        metrics::record_chat_request("invalid");
        tracing::warn!(request_id = %request_id, errors = %errors, "Incomplete energy profile");
        AppError::BadRequest(anyhow::anyhow!(INCOMPLETE_DATA_MESSAGE))
    })?;

    let prompt = build_prompt(&profile);
    let params = state.generation.params();
    let provider = &state.text_provider;

    tracing::info!(
        request_id = %request_id,
        provider = provider.name(),
        model = %provider.model(),
        devices = profile.product_names.len(),
        "Opening upstream stream"
    );

    let started = Instant::now();
    let upstream = provider
        .generate_stream(&prompt, &params)
        .await
        .map_err(|e| {
            metrics::record_chat_request("upstream_failed");
            metrics::record_upstream_error(provider.name(), "open", e.kind());
            tracing::error!(
                request_id = %request_id,
                provider = provider.name(),
                phase = "open",
                error = %e,
                "Failed to open upstream stream"
            );
            AppError::ModelError(e.to_string())
        })?;

    metrics::record_upstream_open_latency(
        provider.name(),
        provider.model(),
        started.elapsed().as_secs_f64(),
    );
    metrics::record_chat_request("accepted");

    Ok(relay_response(
        upstream,
        RelayContext {
            request_id: request_id.0,
            provider: provider.name(),
            model: provider.model().to_string(),
        },
    ))
}
