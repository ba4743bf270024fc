//! Pluggable LLM client trait.
//!
//! Implementations translate provider-agnostic [`ChatRequest`]/[`ChatResponse`]
//! into provider-specific SDK calls. This keeps routing and pipeline logic
//! decoupled from any particular LLM vendor.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use super::message::{ChatRequest, ChatResponse};
use crate::error::ClientError;

/// Boxed stream of text deltas from a streaming completion.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// Trait for LLM backend clients.
///
/// Implementations handle the transport layer (HTTP, SDK calls) for a
/// specific provider while presenting a uniform interface to the router
/// and pipelines.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Client name (e.g., `"openai"`).
    fn name(&self) -> &'static str;

    /// Executes a chat completion request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on API failures, timeouts, or parse errors.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError>;

    /// Executes a streaming chat completion request.
    ///
    /// Returns a stream of text chunks as they arrive from the backend.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] on connection or streaming failures.
    async fn chat_stream(&self, request: &ChatRequest) -> Result<TextStream, ClientError>;
}
