//! `text/event-stream` decoding for OpenAI-compatible streaming replies.
//!
//! Event framing (LF, CRLF and bare CR line endings, multi-line `data:`,
//! comments, UTF-8 split across network chunks) is handled by
//! `eventsource-stream`. This module only maps events onto what the
//! providers care about.

use super::ProviderError;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::{Stream, StreamExt};
use std::fmt::Display;

/// Sentinel payload OpenAI-compatible APIs send after the last chunk.
const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    /// Joined `data:` lines of one event.
    Data(String),
    /// The `[DONE]` terminator.
    Done,
}

/// Decode a streamed HTTP body into events.
pub fn sse_events<S, B, E>(body: S) -> impl Stream<Item = Result<SseEvent, ProviderError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    body.eventsource().map(|event| match event {
        Ok(event) if event.data.trim() == DONE_SENTINEL => Ok(SseEvent::Done),
        Ok(event) => Ok(SseEvent::Data(event.data)),
        Err(EventStreamError::Transport(e)) => Err(ProviderError::NetworkError(e.to_string())),
        Err(e) => Err(ProviderError::StreamError(format!("Malformed event stream: {}", e))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    async fn decode(chunks: &[&'static [u8]]) -> Vec<SseEvent> {
        let body = futures::stream::iter(chunks.iter().map(|chunk| Ok::<_, Infallible>(*chunk)));
        sse_events(body)
            .map(|event| event.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn decodes_event_split_across_chunks() {
        let events = decode(&[b"data: {\"a\":", b"1}\n\ndata: [DONE]\n\n"]).await;
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".to_string()), SseEvent::Done]
        );
    }

    #[tokio::test]
    async fn handles_crlf_separators() {
        let events = decode(&[b"data: first\r\n\r\ndata: second\r\n\r\n"]).await;
        assert_eq!(
            events,
            vec![
                SseEvent::Data("first".to_string()),
                SseEvent::Data("second".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn handles_bare_cr_line_endings() {
        let events = decode(&[b"data: hi\r\rdata: there\r\rdata: [DONE]\n\n"]).await;
        assert_eq!(
            events,
            vec![
                SseEvent::Data("hi".to_string()),
                SseEvent::Data("there".to_string()),
                SseEvent::Done
            ]
        );
    }

    #[tokio::test]
    async fn keeps_multibyte_characters_split_between_chunks() {
        let payload: &'static [u8] = "data: caf\u{e9} \u{26a1}\n\n".as_bytes();
        // Split inside the three-byte lightning bolt.
        let split = payload.len() - 4;

        let events = decode(&[&payload[..split], &payload[split..]]).await;
        assert_eq!(events, vec![SseEvent::Data("caf\u{e9} \u{26a1}".to_string())]);
    }

    #[tokio::test]
    async fn ignores_comments_and_other_fields() {
        let events = decode(&[b": keep-alive\n\nevent: message\nid: 7\ndata: hi\n\n"]).await;
        assert_eq!(events, vec![SseEvent::Data("hi".to_string())]);
    }

    #[tokio::test]
    async fn joins_multiple_data_lines() {
        let events = decode(&[b"data: one\ndata: two\n\n"]).await;
        assert_eq!(events, vec![SseEvent::Data("one\ntwo".to_string())]);
    }

    #[tokio::test]
    async fn transport_errors_become_network_errors() {
        let body = futures::stream::iter(vec![
            Ok(&b"data: partial"[..]),
            Err("connection reset"),
        ]);
        let events: Vec<_> = sse_events(body).collect().await;

        assert!(matches!(
            events.last(),
            Some(Err(ProviderError::NetworkError(msg))) if msg == "connection reset"
        ));
    }
}
