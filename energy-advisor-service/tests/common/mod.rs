#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request},
    response::Response,
    Router,
};
use energy_advisor_service::config::GenerationConfig;
use energy_advisor_service::services::providers::TextProvider;
use energy_advisor_service::{build_router, AppState};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn app_with(provider: Arc<dyn TextProvider>) -> Router {
    build_router(AppState::new(provider, GenerationConfig::default()))
}

pub fn valid_profile() -> Value {
    json!({
        "totalEnergyConsumption": 412,
        "productNames": ["Fridge", "Heater"],
        "powerRatings": [150, 2000],
        "hours": [24, 3.5]
    })
}

pub fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_string(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
