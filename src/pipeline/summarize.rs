//! Chunk summarization.
//!
//! The map function asks a router-selected backend for a tight summary
//! of one chunk. The fallback is extractive: the leading sentences of
//! the chunk stand in for a model summary, so the reduce phase always
//! has something to work with.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ChunkResult;
use super::executor::ChunkProcessor;
use crate::chunking::Chunk;
use crate::client::LlmClient;
use crate::client::message::{ChatRequest, system_message, user_message};
use crate::error::{ClientError, PipelineError};
use crate::router::{ModelRouter, Priority, RouterConfig, TaskKind};

/// Response budget for summary calls.
const MAX_OUTPUT_TOKENS: u32 = 1024;

/// Byte budget for the extractive fallback summary.
const FALLBACK_SUMMARY_LEN: usize = 600;

/// Free-form summary of one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryChunk {
    /// Index of the source chunk.
    #[serde(default)]
    pub index: usize,
    /// Summary text.
    pub summary: String,
}

const SUMMARY_SYSTEM_PROMPT: &str = "\
You summarize documents faithfully and concisely. Keep concrete names, \
numbers, and decisions; drop filler. Respond with the summary only.";

/// Extractive stand-in: leading sentences up to the byte budget.
fn extractive_summary(text: &str) -> String {
    if text.len() <= FALLBACK_SUMMARY_LEN {
        return text.to_string();
    }
    let mut cut = text[..FALLBACK_SUMMARY_LEN]
        .rfind('.')
        .map_or(FALLBACK_SUMMARY_LEN, |p| p + 1);
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].trim().to_string()
}

/// Router-driven summarization map function.
pub struct LlmSummarizer {
    client: Arc<dyn LlmClient>,
    router: Arc<ModelRouter>,
    timeout: Duration,
}

impl LlmSummarizer {
    /// Creates a summarizer that routes every call through `router`.
    #[must_use]
    pub const fn new(
        client: Arc<dyn LlmClient>,
        router: Arc<ModelRouter>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            router,
            timeout,
        }
    }

    async fn invoke(&self, backend: &str, prompt: &str) -> Result<String, ClientError> {
        let request = ChatRequest {
            model: backend.to_string(),
            messages: vec![system_message(SUMMARY_SYSTEM_PROMPT), user_message(prompt)],
            temperature: Some(0.2),
            max_tokens: Some(MAX_OUTPUT_TOKENS),
            json_mode: false,
            stream: false,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.client.chat(&request)).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            Ok(Ok(response)) => {
                let trimmed = response.content.trim();
                if trimmed.is_empty() {
                    Err(ClientError::ApiRequest {
                        message: "empty summary response".to_string(),
                        status: None,
                    })
                } else {
                    Ok(trimmed.to_string())
                }
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ClientError::DeadlineExceeded {
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        };

        self.router
            .telemetry()
            .update(backend, latency_ms, result.is_ok());
        result
    }
}

#[async_trait]
impl ChunkProcessor for LlmSummarizer {
    async fn process(&self, chunk: &Chunk) -> Result<ChunkResult, PipelineError> {
        let config = RouterConfig::new(
            TaskKind::Summarization,
            Priority::Balanced,
            super::extraction::complexity_for(chunk.text.len()),
        );
        let selection = self.router.select(&config).map_err(|e| {
            PipelineError::InvalidInput {
                message: e.to_string(),
            }
        })?;

        let prompt = format!("Summarize the following text.\n\n<text>\n{}\n</text>", chunk.text);
        let summary = self.invoke(&selection.backend, &prompt).await?;
        Ok(ChunkResult::Summary(SummaryChunk {
            index: chunk.index,
            summary,
        }))
    }

    /// Degraded map: extractive leading-sentence summary, no model call.
    async fn fallback(&self, chunk: &Chunk, error: &PipelineError) -> Option<ChunkResult> {
        debug!(chunk = chunk.index, error = %error, "summarization falling back to extractive");
        Some(ChunkResult::Summary(SummaryChunk {
            index: chunk.index,
            summary: extractive_summary(&chunk.text),
        }))
    }
}
