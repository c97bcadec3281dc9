pub mod claude;
pub mod error;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod sanitize;
pub mod stream;
pub mod translate;

pub use claude::ClaudeProvider;
pub use error::{ErrorCode, ProviderError};
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use stream::{into_stream, ChunkReceiver, CHUNK_CHANNEL_CAPACITY};

use crate::types::{ChatRequest, Model};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Uniform contract over every chat backend.
///
/// `send_message` validates and translates the request synchronously; any
/// failure after that point arrives as the stream's terminal `error` chunk.
/// Dropping the receiver or firing `cancel` stops the producer task and
/// closes the channel without an error chunk.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable backend tag: "claude", "openai", "gemini" or "ollama".
    fn name(&self) -> &'static str;

    /// Start a streaming completion.
    fn send_message(
        &self,
        cancel: CancellationToken,
        request: ChatRequest,
    ) -> Result<ChunkReceiver, ProviderError>;

    /// Cheapest authenticated round trip the backend offers.
    async fn validate_credentials(&self, cancel: &CancellationToken) -> Result<(), ProviderError>;

    /// Models this backend can serve. A fresh list on every call.
    async fn list_models(&self) -> Result<Vec<Model>, ProviderError>;
}

/// Connection-pooling HTTP client shared by one provider instance.
pub fn http_client(
    request_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
) -> Result<reqwest::Client, ProviderError> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(timeout) = connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| ProviderError::invalid_request(&format!("failed to build HTTP client: {}", e)))
}

/// Run a unary backend call unless the caller cancels first.
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    redactor: &sanitize::Redactor,
    backend: &str,
    fut: impl std::future::Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::new(
            redactor,
            ErrorCode::Timeout,
            "canceled by caller",
            format!("The request to {} was canceled.", backend),
        )),
        out = fut => out,
    }
}
