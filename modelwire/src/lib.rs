pub mod config;
pub mod models;
pub mod providers;
pub mod types;

// Re-exports for convenience
pub use config::{resolve_credential, ProviderConfig, ProviderKind, UnknownProvider};
pub use models::static_models;
pub use providers::{
    into_stream, ChunkReceiver, ClaudeProvider, ErrorCode, GeminiProvider, OllamaProvider,
    OpenAiProvider, Provider, ProviderError, CHUNK_CHANNEL_CAPACITY,
};
pub use tokio_util::sync::CancellationToken;
pub use types::*;
