//! Streaming relay: re-emits an upstream fragment stream as one JSON document
//! of the form `{"response": "<text>"}`, written to the client piece by piece.
//!
//! The document is framed by hand so that nothing is buffered beyond the
//! fragment in hand, but every fragment goes through a real JSON string
//! encoder, so quotes, backslashes, newlines and control characters in model
//! output cannot break the document.
//!
//! Once the opening bytes are out the status line is committed. If the
//! upstream then fails, the string is closed and an `"error"` member is
//! appended, keeping the body valid JSON:
//! `{"response": "<partial>", "error": "<message>"}`.

use crate::services::metrics;
use crate::services::providers::{ProviderError, ProviderStream, StreamChunk};
use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// Bytes written before the first fragment.
pub const RESPONSE_OPEN: &str = "{\"response\": \"";

/// Bytes written after the last fragment.
pub const RESPONSE_CLOSE: &str = "\"}";

/// Encoded frames queued between the relay task and the socket. The relay
/// stops pulling from upstream while the queue is full.
pub const RELAY_BUFFER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Nothing written yet.
    Idle,
    /// Opening bytes written, fragments flowing.
    Streaming,
    /// Document closed after the last fragment.
    Closed,
    /// Document closed with an `"error"` member after an upstream failure.
    Aborted,
}

/// Produces the bytes of the response document, enforcing
/// `Idle -> Streaming -> Closed | Aborted`. Calls that do not fit the current state
/// return `None` and write nothing.
#[derive(Debug)]
pub struct ResponseFramer {
    state: RelayState,
    fragments: u64,
    bytes: u64,
}

impl Default for ResponseFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self {
            state: RelayState::Idle,
            fragments: 0,
            bytes: 0,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Fragments written so far.
    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    /// Body bytes produced so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn open(&mut self) -> Option<Bytes> {
        if self.state != RelayState::Idle {
            return None;
        }
        self.state = RelayState::Streaming;
        Some(self.emit(Bytes::from_static(RESPONSE_OPEN.as_bytes())))
    }

    /// Encode one fragment. Empty fragments produce nothing.
    pub fn fragment(&mut self, text: &str) -> Option<Bytes> {
        if self.state != RelayState::Streaming || text.is_empty() {
            return None;
        }
        self.fragments += 1;
        Some(self.emit(Bytes::from(escape_json_string(text))))
    }

    pub fn close(&mut self) -> Option<Bytes> {
        if self.state != RelayState::Streaming {
            return None;
        }
        self.state = RelayState::Closed;
        Some(self.emit(Bytes::from_static(RESPONSE_CLOSE.as_bytes())))
    }

    /// Close the string and append an `"error"` member.
    pub fn abort(&mut self, message: &str) -> Option<Bytes> {
        if self.state != RelayState::Streaming {
            return None;
        }
        self.state = RelayState::Aborted;
        let tail = format!("\", \"error\": {}}}", Value::from(message));
        Some(self.emit(Bytes::from(tail)))
    }

    fn emit(&mut self, bytes: Bytes) -> Bytes {
        self.bytes += bytes.len() as u64;
        bytes
    }
}

/// JSON-escape `text` for use inside an already opened string literal.
pub fn escape_json_string(text: &str) -> String {
    let quoted = Value::from(text).to_string();
    // Serialized strings always start and end with an ASCII quote.
    quoted[1..quoted.len() - 1].to_string()
}

/// Identifies a relay in logs and metrics.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub request_id: String,
    pub provider: &'static str,
    pub model: String,
}

/// Turn an opened upstream stream into a streaming `200 application/json`
/// response. The relay runs in its own task; dropping the response body
/// (client gone) stops it and drops the upstream stream.
pub fn relay_response(upstream: ProviderStream, context: RelayContext) -> Response {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(RELAY_BUFFER);
    tokio::spawn(run_relay(upstream, tx, context).instrument(tracing::Span::current()));

    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayOutcome {
    Completed,
    Failed,
    Disconnected,
}

impl RelayOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RelayOutcome::Completed => "completed",
            RelayOutcome::Failed => "failed",
            RelayOutcome::Disconnected => "disconnected",
        }
    }
}

enum Step {
    Next(Option<Result<StreamChunk, ProviderError>>),
    ClientGone,
}

async fn run_relay(
    mut upstream: ProviderStream,
    tx: mpsc::Sender<Result<Bytes, Infallible>>,
    context: RelayContext,
) {
    let started = Instant::now();
    metrics::inc_relays_in_flight();

    let mut framer = ResponseFramer::new();
    let outcome = pump(&mut upstream, &tx, &mut framer, &context).await;

    // Release the upstream connection before bookkeeping.
    drop(upstream);

    let elapsed = started.elapsed();
    metrics::dec_relays_in_flight();
    metrics::record_relay(
        outcome.as_str(),
        framer.fragments(),
        framer.bytes(),
        elapsed.as_secs_f64(),
    );

    match outcome {
        RelayOutcome::Completed => tracing::info!(
            request_id = %context.request_id,
            fragments = framer.fragments(),
            bytes = framer.bytes(),
            duration_ms = elapsed.as_millis() as u64,
            "Relay completed"
        ),
        RelayOutcome::Disconnected => tracing::warn!(
            request_id = %context.request_id,
            fragments = framer.fragments(),
            "Client disconnected, upstream stream released"
        ),
        // Logged where the error was observed.
        RelayOutcome::Failed => {}
    }
}

async fn pump(
    upstream: &mut ProviderStream,
    tx: &mpsc::Sender<Result<Bytes, Infallible>>,
    framer: &mut ResponseFramer,
    context: &RelayContext,
) -> RelayOutcome {
    if let Some(open) = framer.open() {
        if tx.send(Ok(open)).await.is_err() {
            return RelayOutcome::Disconnected;
        }
    }

    loop {
        let step = tokio::select! {
            _ = tx.closed() => Step::ClientGone,
            next = upstream.next() => Step::Next(next),
        };

        let item = match step {
            Step::ClientGone => return RelayOutcome::Disconnected,
            Step::Next(None) => break,
            Step::Next(Some(item)) => item,
        };

        match item {
            Ok(StreamChunk::Text(text)) => {
                if let Some(bytes) = framer.fragment(&text) {
                    if tx.send(Ok(bytes)).await.is_err() {
                        return RelayOutcome::Disconnected;
                    }
                }
            }
            Ok(StreamChunk::Complete {
                input_tokens,
                output_tokens,
                finish_reason,
            }) => {
                metrics::record_tokens(&context.model, input_tokens, output_tokens);
                tracing::debug!(
                    request_id = %context.request_id,
                    input_tokens,
                    output_tokens,
                    finish_reason = finish_reason.as_str(),
                    "Upstream stream finished"
                );
            }
            Err(e) => {
                tracing::error!(
                    request_id = %context.request_id,
                    provider = context.provider,
                    phase = "mid_stream",
                    fragments = framer.fragments(),
                    error = %e,
                    "Upstream failed after streaming started"
                );
                metrics::record_upstream_error(context.provider, "mid_stream", e.kind());

                if let Some(tail) = framer.abort(&e.to_string()) {
                    let _ = tx.send(Ok(tail)).await;
                }
                return RelayOutcome::Failed;
            }
        }
    }

    if let Some(close) = framer.close() {
        if tx.send(Ok(close)).await.is_err() {
            return RelayOutcome::Disconnected;
        }
    }

    RelayOutcome::Completed
}
