//! Flow-control behaviour of the relay: bounded buffering, long streams and
//! client disconnects.

mod common;

use async_trait::async_trait;
use axum::http::StatusCode;
use common::{app_with, chat_request, valid_profile};
use energy_advisor_service::services::providers::{
    ChatPrompt, GenerationParams, ProviderError, ProviderStream, StreamChunk, TextProvider,
};
use energy_advisor_service::services::relay::{RELAY_BUFFER, RESPONSE_CLOSE, RESPONSE_OPEN};
use futures::StreamExt;
use http_body_util::BodyExt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

/// Sets its flag when the upstream stream that owns it is dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Lazily produces `total` numbered fragments and counts how many were pulled.
struct CountingProvider {
    total: usize,
    pulled: Arc<AtomicUsize>,
    dropped: Arc<AtomicBool>,
}

impl CountingProvider {
    fn new(total: usize) -> Self {
        Self {
            total,
            pulled: Arc::new(AtomicUsize::new(0)),
            dropped: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl TextProvider for CountingProvider {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn model(&self) -> &str {
        "counting-model"
    }

    async fn generate_stream(
        &self,
        _prompt: &ChatPrompt,
        _params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        let pulled = self.pulled.clone();
        let guard = DropFlag(self.dropped.clone());

        let stream = futures::stream::iter(0..self.total).map(move |i| {
            let _held = &guard;
            pulled.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ProviderError>(StreamChunk::Text(format!("chunk-{i} ")))
        });

        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[tokio::test]
async fn relays_long_stream_without_accumulating() {
    const TOTAL: usize = 20_000;
    let provider = Arc::new(CountingProvider::new(TOTAL));

    let response = app_with(provider.clone())
        .oneshot(chat_request(&valid_profile()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let mut document = Vec::new();
    let mut frames = 0usize;
    let mut largest_frame = 0usize;

    while let Some(frame) = body.frame().await {
        let data = frame.unwrap().into_data().unwrap();
        frames += 1;
        largest_frame = largest_frame.max(data.len());
        document.extend_from_slice(&data);
    }

    // Opening bytes, one frame per fragment, closing bytes.
    assert_eq!(frames, TOTAL + 2);
    assert!(largest_frame <= "chunk-19999 ".len().max(RESPONSE_OPEN.len()));

    let text = String::from_utf8(document).unwrap();
    assert!(text.starts_with(RESPONSE_OPEN));
    assert!(text.ends_with(RESPONSE_CLOSE));

    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    let response_text = parsed["response"].as_str().unwrap();
    assert!(response_text.starts_with("chunk-0 chunk-1 "));
    assert!(response_text.ends_with("chunk-19999 "));
    assert_eq!(provider.pulled.load(Ordering::SeqCst), TOTAL);
}

#[tokio::test]
async fn stalled_reader_stops_upstream_pulls() {
    let provider = Arc::new(CountingProvider::new(1_000_000));

    let response = app_with(provider.clone())
        .oneshot(chat_request(&valid_profile()))
        .await
        .unwrap();
    let mut body = response.into_body();

    // Read the opening bytes and two fragments, then stop reading.
    for _ in 0..3 {
        body.frame().await.unwrap().unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pulled_after_stall = provider.pulled.load(Ordering::SeqCst);

    // Two consumed, a full queue, and one fragment waiting for room.
    assert!(
        pulled_after_stall <= 2 + RELAY_BUFFER + 1,
        "relay pulled {pulled_after_stall} fragments while the reader was stalled"
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.pulled.load(Ordering::SeqCst), pulled_after_stall);
    assert!(!provider.dropped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn dropping_the_body_releases_upstream() {
    let provider = Arc::new(CountingProvider::new(1_000_000));

    let response = app_with(provider.clone())
        .oneshot(chat_request(&valid_profile()))
        .await
        .unwrap();
    let mut body = response.into_body();
    body.frame().await.unwrap().unwrap();
    body.frame().await.unwrap().unwrap();

    drop(body);

    let released = tokio::time::timeout(Duration::from_secs(2), async {
        while !provider.dropped.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(released.is_ok(), "upstream stream was not dropped");
    assert!(provider.pulled.load(Ordering::SeqCst) < 1_000_000);
}
