//! Groq chat completion provider.
//!
//! Groq serves the OpenAI-compatible `/chat/completions` API. Replies are
//! requested with `stream: true` and arrive as server-sent events, one JSON
//! chunk per event, finished by `data: [DONE]`.

use super::sse::{sse_events, SseEvent};
use super::{
    ChatPrompt, FinishReason, GenerationParams, ProviderError, ProviderStream, StreamChunk,
    TextProvider,
};
use crate::config::GroqConfig;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use service_core::observability::TracedClientExt;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoded chunks waiting for the relay. Kept small so a slow reader stalls
/// the upstream socket instead of growing memory.
const CHUNK_BUFFER: usize = 4;

/// Groq text provider.
pub struct GroqTextProvider {
    config: GroqConfig,
    client: Client,
}

impl GroqTextProvider {
    pub fn new(config: GroqConfig) -> Result<Self, ProviderError> {
        // Per-read timeout rather than a whole-request one: long replies
        // legitimately stream for longer than any fixed deadline.
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base.trim_end_matches('/'), path)
    }

    fn build_request<'a>(
        &'a self,
        prompt: &'a ChatPrompt,
        params: &GenerationParams,
    ) -> ChatCompletionRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &prompt.system {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &prompt.user,
        });

        ChatCompletionRequest {
            model: &self.config.model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stream: true,
            stop: if params.stop_sequences.is_empty() {
                None
            } else {
                Some(params.stop_sequences.clone())
            },
        }
    }
}

#[async_trait]
impl TextProvider for GroqTextProvider {
    fn name(&self) -> &'static str {
        "groq"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    async fn generate_stream(
        &self,
        prompt: &ChatPrompt,
        params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        if self.config.api_key.expose_secret().is_empty() {
            return Err(ProviderError::NotConfigured(
                "Groq API key not configured".to_string(),
            ));
        }

        let request = self.build_request(prompt, params);
        let url = self.api_url("chat/completions");

        tracing::debug!(
            model = %self.config.model,
            prompt_len = prompt.user.len(),
            "Starting streaming request to Groq API"
        );

        let response = self
            .client
            .traced_post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let response = check_status(response).await?;

        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        tokio::spawn(pump_events(response, tx).instrument(tracing::Span::current()));

        Ok(Box::pin(ReceiverStream::new(rx)) as ProviderStream)
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.config.api_key.expose_secret().is_empty() {
            return Err(ProviderError::NotConfigured(
                "Groq API key not configured".to_string(),
            ));
        }

        let response = self
            .client
            .traced_get(&self.api_url("models"))
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        check_status(response).await.map(|_| ())
    }
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ProviderError::RateLimited);
    }

    let error_text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorEnvelope>(&error_text)
        .map(|envelope| envelope.error.message)
        .unwrap_or(error_text);

    if status == StatusCode::BAD_REQUEST {
        return Err(ProviderError::InvalidRequest(message));
    }

    Err(ProviderError::ApiError(format!(
        "Groq API error {}: {}",
        status, message
    )))
}

/// Read the event stream and forward decoded chunks until the body ends,
/// the API reports an error, or the receiver goes away. Returning drops the
/// response, which releases the upstream connection.
async fn pump_events(response: Response, tx: mpsc::Sender<Result<StreamChunk, ProviderError>>) {
    let events = sse_events(response.bytes_stream());
    let mut events = pin!(events);
    let mut state = ChunkState::default();

    loop {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!("Relay dropped, abandoning Groq stream");
                return;
            }
            next = events.next() => next,
        };

        let data = match next {
            None | Some(Ok(SseEvent::Done)) => break,
            Some(Ok(SseEvent::Data(data))) => data,
            Some(Err(e)) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        match state.apply(&data) {
            Ok(Some(text)) => {
                if tx.send(Ok(StreamChunk::Text(text))).await.is_err() {
                    tracing::debug!("Relay dropped, abandoning Groq stream");
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    let _ = tx.send(Ok(state.complete())).await;
}

/// Usage and finish reason seen so far in one stream.
#[derive(Debug, Default)]
struct ChunkState {
    input_tokens: u32,
    output_tokens: u32,
    finish_reason: Option<FinishReason>,
}

impl ChunkState {
    /// Fold one event payload in, returning its text delta if it has one.
    fn apply(&mut self, data: &str) -> Result<Option<String>, ProviderError> {
        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping unparseable Groq stream event");
                return Ok(None);
            }
        };

        if let Some(error) = chunk.error {
            return Err(ProviderError::StreamError(error.message));
        }

        if let Some(usage) = chunk
            .usage
            .or_else(|| chunk.x_groq.and_then(|extension| extension.usage))
        {
            self.input_tokens = usage.prompt_tokens;
            self.output_tokens = usage.completion_tokens;
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return Ok(None);
        };

        if let Some(reason) = choice.finish_reason.as_deref() {
            self.finish_reason = Some(FinishReason::from_api(reason));
        }

        Ok(choice.delta.content.filter(|text| !text.is_empty()))
    }

    fn complete(&self) -> StreamChunk {
        StreamChunk::Complete {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            finish_reason: self.finish_reason.unwrap_or(FinishReason::Complete),
        }
    }
}

// ============================================================================
// Groq API Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
    // Sent as an explicit null when there are no stop sequences.
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    x_groq: Option<GroqExtension>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GroqExtension {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn provider() -> GroqTextProvider {
        GroqTextProvider::new(GroqConfig {
            api_key: Secret::new("test-key".to_string()),
            api_base: "https://api.groq.com/openai/v1/".to_string(),
            model: "deepseek-r1-distill-qwen-32b".to_string(),
            request_timeout_secs: 30,
        })
        .unwrap()
    }

    #[test]
    fn api_url_joins_without_double_slash() {
        assert_eq!(
            provider().api_url("chat/completions"),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn request_body_sends_null_stop_and_system_message() {
        let provider = provider();
        let prompt = ChatPrompt::new("How do I save energy?").with_system("Be brief.");
        let params = GenerationParams {
            temperature: Some(0.7),
            top_p: Some(1.0),
            max_tokens: Some(1024),
            stop_sequences: Vec::new(),
        };

        let body = serde_json::to_value(provider.build_request(&prompt, &params)).unwrap();

        assert_eq!(body["model"], "deepseek-r1-distill-qwen-32b");
        assert_eq!(body["stream"], true);
        assert!(body["stop"].is_null());
        assert!(body.as_object().unwrap().contains_key("stop"));
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "How do I save energy?");
    }

    #[test]
    fn chunk_state_extracts_deltas_and_usage() {
        let mut state = ChunkState::default();

        let first = state
            .apply(r#"{"choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#)
            .unwrap();
        assert_eq!(first, None);

        let second = state
            .apply(r#"{"choices":[{"index":0,"delta":{"content":"Use \"Eco\""}}]}"#)
            .unwrap();
        assert_eq!(second.as_deref(), Some("Use \"Eco\""));

        let last = state
            .apply(
                r#"{"choices":[{"index":0,"delta":{},"finish_reason":"length"}],
                    "x_groq":{"usage":{"prompt_tokens":42,"completion_tokens":1024}}}"#,
            )
            .unwrap();
        assert_eq!(last, None);

        assert_eq!(
            state.complete(),
            StreamChunk::Complete {
                input_tokens: 42,
                output_tokens: 1024,
                finish_reason: FinishReason::Length,
            }
        );
    }

    #[test]
    fn chunk_state_surfaces_stream_errors() {
        let mut state = ChunkState::default();
        let err = state
            .apply(r#"{"error":{"message":"model overloaded","type":"server_error"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::StreamError(msg) if msg == "model overloaded"));
    }

    #[test]
    fn chunk_state_skips_garbage() {
        let mut state = ChunkState::default();
        assert_eq!(state.apply("not json").unwrap(), None);
    }

    /// Response whose body is an endless run of content events.
    fn endless_response(served: Arc<AtomicUsize>) -> Response {
        let body = futures::stream::iter(0u64..).map(move |i| {
            served.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"part-{i} \"}}}}]}}\n\n"
            ))
        });
        Response::from(axum::http::Response::new(reqwest::Body::wrap_stream(body)))
    }

    #[tokio::test]
    async fn decode_task_stops_when_receiver_drops() {
        let served = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);
        let task = tokio::spawn(pump_events(endless_response(served.clone()), tx));

        let first = rx.recv().await.unwrap().unwrap();
        assert_eq!(first, StreamChunk::Text("part-0 ".to_string()));
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("decode task kept reading after its receiver dropped")
            .unwrap();
        assert!(served.load(Ordering::SeqCst) < 100);
    }
}
