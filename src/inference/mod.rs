pub mod openai;
pub mod sse;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::InferenceError;
use crate::types::{ChatChunk, ChatCompletion, ChatRequest};

/// Incremental payloads of one streaming completion.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, InferenceError>> + Send>>;

/// Raw chat-completion call. No retries, no aggregation.
/// Request in, payloads out.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Start a streaming completion. Errors before the first payload are
    /// returned here; errors while reading come through the stream.
    async fn stream(&self, request: &ChatRequest) -> Result<ChunkStream, InferenceError>;

    /// Single-shot completion.
    async fn complete(&self, request: &ChatRequest) -> Result<ChatCompletion, InferenceError>;

    /// Release any held connections. Called once per handle.
    async fn shutdown(&self) {}
}

pub use openai::OpenAiTransport;
