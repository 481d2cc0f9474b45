//! Scripted provider for tests and offline runs.

use super::{
    ChatPrompt, FinishReason, GenerationParams, ProviderError, ProviderStream, StreamChunk,
    TextProvider,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// What the mock does when a stream is opened.
#[derive(Debug, Clone)]
pub enum MockScript {
    /// Emit these fragments, then complete.
    Fragments(Vec<String>),
    /// Refuse to open the stream.
    FailOnOpen(String),
    /// Emit these fragments, then fail.
    FailMidStream {
        fragments: Vec<String>,
        error: String,
    },
}

/// Mock text provider for testing.
pub struct MockTextProvider {
    script: MockScript,
    calls: AtomicUsize,
    last_prompt: Mutex<Option<ChatPrompt>>,
}

impl MockTextProvider {
    pub fn new(script: MockScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn with_fragments<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(MockScript::Fragments(
            fragments.into_iter().map(Into::into).collect(),
        ))
    }

    /// Number of streams opened so far, failed opens included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompt passed to the most recent call.
    pub fn last_prompt(&self) -> Option<ChatPrompt> {
        self.last_prompt
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }
}

#[async_trait]
impl TextProvider for MockTextProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn generate_stream(
        &self,
        prompt: &ChatPrompt,
        _params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = Some(prompt.clone());
        }

        let input_tokens = (prompt.user.len() / 4) as u32;

        let chunks: Vec<Result<StreamChunk, ProviderError>> = match &self.script {
            MockScript::FailOnOpen(message) => {
                return Err(ProviderError::NetworkError(message.clone()));
            }
            MockScript::Fragments(fragments) => fragments
                .iter()
                .cloned()
                .map(|text| Ok(StreamChunk::Text(text)))
                .chain(std::iter::once(Ok(StreamChunk::Complete {
                    input_tokens,
                    output_tokens: fragments.len() as u32,
                    finish_reason: FinishReason::Complete,
                })))
                .collect(),
            MockScript::FailMidStream { fragments, error } => fragments
                .iter()
                .cloned()
                .map(|text| Ok(StreamChunk::Text(text)))
                .chain(std::iter::once(Err(ProviderError::StreamError(
                    error.clone(),
                ))))
                .collect(),
        };

        Ok(Box::pin(tokio_stream::iter(chunks)))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        match &self.script {
            MockScript::FailOnOpen(message) => Err(ProviderError::NetworkError(message.clone())),
            _ => Ok(()),
        }
    }
}
