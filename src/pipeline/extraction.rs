//! Entity extraction over chunks.
//!
//! The map function asks a router-selected backend for people,
//! companies, concepts, and relationships mentioned in one chunk,
//! validated against a declared schema. The fallback retries once on
//! the cheapest adequate backend with lenient parsing before giving up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ChunkResult;
use super::executor::ChunkProcessor;
use crate::chunking::Chunk;
use crate::client::message::{ChatRequest, system_message, user_message};
use crate::client::{FieldSpec, LlmClient, Schema, SchemaNode, SchemaValidator};
use crate::error::{ClientError, PipelineError};
use crate::router::{Capability, Complexity, ModelRouter, Priority, RouterConfig, TaskKind};

/// Maximum entities kept per class per chunk.
const MAX_MENTIONS: usize = 50;

/// Maximum length of any extracted text field.
const MAX_FIELD_LEN: usize = 2_000;

/// Response budget for extraction calls.
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// A person mentioned in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonMention {
    /// Name as written in the text.
    pub name: String,
    /// Stated role or title, when the text gives one.
    #[serde(default)]
    pub role: Option<String>,
}

/// A company or organization mentioned in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyMention {
    /// Name as written in the text.
    pub name: String,
    /// Stated industry, when the text gives one.
    #[serde(default)]
    pub industry: Option<String>,
}

/// A named concept or topic mentioned in a chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConceptMention {
    /// Concept name.
    pub name: String,
    /// Definition from the text, when present.
    #[serde(default)]
    pub definition: Option<String>,
}

/// A stated relationship between two people.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipMention {
    /// First participant.
    pub person1: String,
    /// Second participant.
    pub person2: String,
    /// Relationship label (e.g. `"reports_to"`, `"cofounded"`).
    pub relationship_type: String,
    /// Supporting quote or paraphrase from the text.
    #[serde(default)]
    pub evidence: String,
}

/// Entities extracted from one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtractionChunk {
    /// Index of the source chunk. Stamped by the extractor; model
    /// output never carries it.
    #[serde(default)]
    pub index: usize,
    /// People mentioned.
    #[serde(default)]
    pub people: Vec<PersonMention>,
    /// Companies mentioned.
    #[serde(default)]
    pub companies: Vec<CompanyMention>,
    /// Concepts mentioned.
    #[serde(default)]
    pub concepts: Vec<ConceptMention>,
    /// Relationships stated between people.
    #[serde(default)]
    pub relationships: Vec<RelationshipMention>,
}

fn text_node() -> SchemaNode {
    SchemaNode::String {
        enum_values: None,
        max_len: Some(MAX_FIELD_LEN),
    }
}

fn mention_list(fields: Vec<FieldSpec>) -> SchemaNode {
    SchemaNode::Array {
        items: Box::new(SchemaNode::Object { fields }),
        max_items: Some(MAX_MENTIONS),
    }
}

/// Declared schema for extraction output.
#[must_use]
pub fn extraction_schema() -> Schema {
    let empty = serde_json::Value::Array(Vec::new());
    Schema::object(
        "extraction",
        vec![
            FieldSpec::with_default(
                "people",
                mention_list(vec![
                    FieldSpec::required("name", text_node()),
                    FieldSpec::with_default("role", text_node(), serde_json::Value::Null),
                ]),
                empty.clone(),
            ),
            FieldSpec::with_default(
                "companies",
                mention_list(vec![
                    FieldSpec::required("name", text_node()),
                    FieldSpec::with_default("industry", text_node(), serde_json::Value::Null),
                ]),
                empty.clone(),
            ),
            FieldSpec::with_default(
                "concepts",
                mention_list(vec![
                    FieldSpec::required("name", text_node()),
                    FieldSpec::with_default("definition", text_node(), serde_json::Value::Null),
                ]),
                empty.clone(),
            ),
            FieldSpec::with_default(
                "relationships",
                mention_list(vec![
                    FieldSpec::required("person1", text_node()),
                    FieldSpec::required("person2", text_node()),
                    FieldSpec::required("relationship_type", text_node()),
                    FieldSpec::with_default(
                        "evidence",
                        text_node(),
                        serde_json::Value::String(String::new()),
                    ),
                ]),
                empty,
            ),
        ],
    )
}

const EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract structured entities from text. Return only JSON with keys \
\"people\", \"companies\", \"concepts\", and \"relationships\". List each \
entity once per response, exactly as written in the text. Only include \
relationships the text states explicitly, with a short evidence quote. \
Return empty arrays for classes with no mentions.";

fn build_extraction_prompt(chunk: &Chunk) -> String {
    format!(
        "Extract all people, companies, concepts, and person-to-person \
         relationships from the following text.\n\n<text>\n{}\n</text>",
        chunk.text
    )
}

/// Difficulty estimate from chunk size.
#[must_use]
pub const fn complexity_for(text_len: usize) -> Complexity {
    if text_len < 2_000 {
        Complexity::Low
    } else if text_len < 10_000 {
        Complexity::Medium
    } else {
        Complexity::High
    }
}

/// Router-driven extraction map function.
pub struct LlmExtractor {
    client: Arc<dyn LlmClient>,
    router: Arc<ModelRouter>,
    validator: Arc<dyn SchemaValidator>,
    schema: Schema,
    timeout: Duration,
}

impl LlmExtractor {
    /// Creates an extractor that routes every call through `router`.
    #[must_use]
    pub fn new(
        client: Arc<dyn LlmClient>,
        router: Arc<ModelRouter>,
        validator: Arc<dyn SchemaValidator>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            router,
            validator,
            schema: extraction_schema(),
            timeout,
        }
    }

    /// Invokes `backend` for `chunk`, recording the outcome in telemetry.
    async fn invoke(
        &self,
        backend: &str,
        chunk: &Chunk,
        json_mode: bool,
    ) -> Result<String, ClientError> {
        let request = ChatRequest {
            model: backend.to_string(),
            messages: vec![
                system_message(EXTRACTION_SYSTEM_PROMPT),
                user_message(&build_extraction_prompt(chunk)),
            ],
            temperature: Some(0.0),
            max_tokens: Some(MAX_OUTPUT_TOKENS),
            json_mode,
            stream: false,
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, self.client.chat(&request)).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let result = match outcome {
            Ok(Ok(response)) => Ok(response.content),
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

    fn parse(&self, index: usize, raw: &str) -> Result<ExtractionChunk, ClientError> {
        let value = self.validator.validate(&self.schema, raw)?;
        let mut parsed: ExtractionChunk =
            serde_json::from_value(value).map_err(|e| ClientError::SchemaValidation {
                message: format!("coerced extraction output untypeable: {e}"),
                content: raw.to_string(),
            })?;
        parsed.index = index;
        Ok(parsed)
    }
}

#[async_trait]
impl ChunkProcessor for LlmExtractor {
    async fn process(&self, chunk: &Chunk) -> Result<ChunkResult, PipelineError> {
        let config = RouterConfig::new(
            TaskKind::Extraction,
            Priority::Balanced,
            complexity_for(chunk.text.len()),
        )
        .require(Capability::StructuredOutput);

        let selection = self.router.select(&config).map_err(|e| {
            PipelineError::InvalidInput {
                message: e.to_string(),
            }
        })?;

        let raw = self.invoke(&selection.backend, chunk, true).await?;
        let parsed = self.parse(chunk.index, &raw)?;
        Ok(ChunkResult::Extraction(parsed))
    }

    /// Degraded attempt: cheapest adequate backend, plain text mode,
    /// lenient parse. Any failure yields `None` and the executor records
    /// the synthetic failure.
    async fn fallback(&self, chunk: &Chunk, error: &PipelineError) -> Option<ChunkResult> {
        debug!(chunk = chunk.index, error = %error, "extraction falling back to cheapest backend");
        let config = RouterConfig::new(TaskKind::Extraction, Priority::Cost, Complexity::Low)
            .require(Capability::StructuredOutput);
        let selection = self.router.select(&config).ok()?;
        let raw = self.invoke(&selection.backend, chunk, false).await.ok()?;
        self.parse(chunk.index, &raw)
            .ok()
            .map(ChunkResult::Extraction)
    }
}
