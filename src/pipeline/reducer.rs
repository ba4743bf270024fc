//! Reduce phase: aggregate per-chunk outputs.
//!
//! Two strategies. The deduplicating merge folds extraction results
//! into per-class entity tables keyed by normalized name, preserving
//! first-seen display forms and provenance. The hierarchical reducer
//! combines free-form summaries through batched model calls until one
//! remains. Both are deterministic functions of their inputs (the
//! hierarchical variant modulo the model itself), so a replay over the
//! same chunk results reproduces the same aggregate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::debug;

use super::summarize::SummaryChunk;
use super::{ChunkResult, FailedChunk};
use crate::client::LlmClient;
use crate::client::message::{ChatRequest, system_message, user_message};
use crate::error::{ClientError, PipelineError};
use crate::router::{Complexity, ModelRouter, Priority, RouterConfig, TaskKind};

/// Inputs at or below this count are combined in a single call.
const SINGLE_PASS_THRESHOLD: usize = 10;

/// Batch size for one hierarchical reduction step.
const REDUCE_BATCH_SIZE: usize = 5;

/// Separator between merged relationship evidence strings.
const EVIDENCE_SEPARATOR: &str = "; ";

/// Response budget for combine calls.
const MAX_OUTPUT_TOKENS: u32 = 2048;

/// A deduplicated person with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Person {
    /// Display name (first-seen form).
    pub name: String,
    /// Role, first non-empty mention wins.
    pub role: Option<String>,
    /// Chunk indexes that mentioned this person, ascending.
    pub chunks: Vec<usize>,
}

/// A deduplicated company with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Company {
    /// Display name (first-seen form).
    pub name: String,
    /// Industry, first non-empty mention wins.
    pub industry: Option<String>,
    /// Chunk indexes that mentioned this company, ascending.
    pub chunks: Vec<usize>,
}

/// A deduplicated concept with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Concept {
    /// Display name (first-seen form).
    pub name: String,
    /// Definition, first non-empty mention wins.
    pub definition: Option<String>,
    /// Chunk indexes that mentioned this concept, ascending.
    pub chunks: Vec<usize>,
}

/// A deduplicated relationship with concatenated evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationship {
    /// First participant (first-seen form).
    pub person1: String,
    /// Second participant (first-seen form).
    pub person2: String,
    /// Relationship label.
    pub relationship_type: String,
    /// Evidence strings joined with `"; "`, substring-deduplicated.
    pub evidence: String,
    /// Chunk indexes that stated this relationship, ascending.
    pub chunks: Vec<usize>,
}

/// Aggregate of an extraction run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionReport {
    /// Deduplicated people, first-seen order.
    pub people: Vec<Person>,
    /// Deduplicated companies, first-seen order.
    pub companies: Vec<Company>,
    /// Deduplicated concepts, first-seen order.
    pub concepts: Vec<Concept>,
    /// Deduplicated relationships, first-seen order.
    pub relationships: Vec<Relationship>,
    /// Chunks that contributed no entities because they failed.
    pub failed_chunks: Vec<FailedChunk>,
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

fn keep_first_nonempty(slot: &mut Option<String>, candidate: Option<&String>) {
    if slot.as_deref().is_none_or(|s| s.trim().is_empty())
        && let Some(c) = candidate
        && !c.trim().is_empty()
    {
        *slot = Some(c.clone());
    }
}

fn push_chunk(chunks: &mut Vec<usize>, index: usize) {
    if chunks.last() != Some(&index) && !chunks.contains(&index) {
        chunks.push(index);
    }
}

/// Appends `addition` to `evidence` with substring-level deduplication:
/// evidence already covered by the accumulator is dropped, and evidence
/// that covers the accumulator replaces it.
fn merge_evidence(evidence: &mut String, addition: &str) {
    let addition = addition.trim();
    if addition.is_empty() || evidence.contains(addition) {
        return;
    }
    if addition.contains(evidence.as_str()) && !evidence.is_empty() {
        *evidence = addition.to_string();
        return;
    }
    if evidence.is_empty() {
        *evidence = addition.to_string();
    } else {
        evidence.push_str(EVIDENCE_SEPARATOR);
        evidence.push_str(addition);
    }
}

/// Folds chunk results into a deduplicated [`ExtractionReport`].
///
/// Pure function of its inputs. Results must be supplied in ascending
/// chunk-index order (as [`ProcessingState::all_results`] yields them)
/// so first-seen tie-breaking lands on the lowest index.
///
/// [`ProcessingState::all_results`]: super::state::ProcessingState::all_results
#[must_use]
pub fn merge_extractions<'a, I>(results: I) -> ExtractionReport
where
    I: IntoIterator<Item = &'a ChunkResult>,
{
    let mut report = ExtractionReport::default();
    let mut people: HashMap<String, usize> = HashMap::new();
    let mut companies: HashMap<String, usize> = HashMap::new();
    let mut concepts: HashMap<String, usize> = HashMap::new();
    let mut relationships: HashMap<(String, String, String), usize> = HashMap::new();

    for result in results {
        let extraction = match result {
            ChunkResult::Extraction(e) => e,
            ChunkResult::Failed(f) => {
                report.failed_chunks.push(f.clone());
                continue;
            }
            ChunkResult::Summary(_) => continue,
        };
        let index = extraction.index;

        for mention in &extraction.people {
            let key = normalize(&mention.name);
            if key.is_empty() {
                continue;
            }
            let slot = *people.entry(key).or_insert_with(|| {
                report.people.push(Person {
                    name: mention.name.trim().to_string(),
                    role: None,
                    chunks: Vec::new(),
                });
                report.people.len() - 1
            });
            let person = &mut report.people[slot];
            keep_first_nonempty(&mut person.role, mention.role.as_ref());
            push_chunk(&mut person.chunks, index);
        }

        for mention in &extraction.companies {
            let key = normalize(&mention.name);
            if key.is_empty() {
                continue;
            }
            let slot = *companies.entry(key).or_insert_with(|| {
                report.companies.push(Company {
                    name: mention.name.trim().to_string(),
                    industry: None,
                    chunks: Vec::new(),
                });
                report.companies.len() - 1
            });
            let company = &mut report.companies[slot];
            keep_first_nonempty(&mut company.industry, mention.industry.as_ref());
            push_chunk(&mut company.chunks, index);
        }

        for mention in &extraction.concepts {
            let key = normalize(&mention.name);
            if key.is_empty() {
                continue;
            }
            let slot = *concepts.entry(key).or_insert_with(|| {
                report.concepts.push(Concept {
                    name: mention.name.trim().to_string(),
                    definition: None,
                    chunks: Vec::new(),
                });
                report.concepts.len() - 1
            });
            let concept = &mut report.concepts[slot];
            keep_first_nonempty(&mut concept.definition, mention.definition.as_ref());
            push_chunk(&mut concept.chunks, index);
        }

        for mention in &extraction.relationships {
            let key = (
                normalize(&mention.person1),
                normalize(&mention.person2),
                normalize(&mention.relationship_type),
            );
            if key.0.is_empty() || key.1.is_empty() {
                continue;
            }
            let slot = *relationships.entry(key).or_insert_with(|| {
                report.relationships.push(Relationship {
                    person1: mention.person1.trim().to_string(),
                    person2: mention.person2.trim().to_string(),
                    relationship_type: mention.relationship_type.trim().to_string(),
                    evidence: String::new(),
                    chunks: Vec::new(),
                });
                report.relationships.len() - 1
            });
            let relationship = &mut report.relationships[slot];
            merge_evidence(&mut relationship.evidence, &mention.evidence);
            push_chunk(&mut relationship.chunks, index);
        }
    }

    report
}

const COMBINE_SYSTEM_PROMPT: &str = "\
You merge partial summaries of one document into a single coherent \
summary. Preserve concrete facts from every input, remove repetition, \
and keep the result tight. Respond with the merged summary only.";

fn build_combine_prompt(summaries: &[SummaryChunk]) -> String {
    let mut prompt = String::from(
        "Combine the following partial summaries into one summary.\n",
    );
    for s in summaries {
        prompt.push_str("\n<summary>\n");
        prompt.push_str(&s.summary);
        prompt.push_str("\n</summary>\n");
    }
    prompt
}

/// Batched hierarchical reduction for free-form summaries.
pub struct HierarchicalReducer {
    client: Arc<dyn LlmClient>,
    router: Arc<ModelRouter>,
    concurrency: usize,
    timeout: Duration,
}

impl HierarchicalReducer {
    /// Creates a reducer sharing the pipeline's concurrency budget.
    #[must_use]
    pub const fn new(
        client: Arc<dyn LlmClient>,
        router: Arc<ModelRouter>,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            router,
            concurrency,
            timeout,
        }
    }

    /// Reduces `summaries` to a single text.
    ///
    /// At most [`SINGLE_PASS_THRESHOLD`] inputs are combined directly;
    /// larger sets reduce in parallel batches of [`REDUCE_BATCH_SIZE`]
    /// and recurse on the batch outputs until one remains.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] when a combine call fails; partial
    /// reduction output is not surfaced.
    pub async fn reduce(&self, mut summaries: Vec<SummaryChunk>) -> Result<String, PipelineError> {
        summaries.sort_by_key(|s| s.index);
        summaries.retain(|s| !s.summary.trim().is_empty());

        loop {
            match summaries.len() {
                0 => return Ok(String::new()),
                1 => return Ok(summaries.remove(0).summary),
                n if n <= SINGLE_PASS_THRESHOLD => {
                    return self.combine(&summaries).await.map_err(PipelineError::from);
                }
                n => {
                    debug!(inputs = n, "hierarchical reduction round");
                    summaries = self.reduce_round(&summaries).await?;
                }
            }
        }
    }

    /// One round: combine each batch concurrently, bounded by the pool.
    async fn reduce_round(
        &self,
        summaries: &[SummaryChunk],
    ) -> Result<Vec<SummaryChunk>, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let mut handles = Vec::new();

        for (batch_index, batch) in summaries.chunks(REDUCE_BATCH_SIZE).enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let batch: Vec<SummaryChunk> = batch.to_vec();
            let client = Arc::clone(&self.client);
            let router = Arc::clone(&self.router);
            let timeout = self.timeout;

            handles.push(tokio::spawn(async move {
                let _permit =
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| PipelineError::Backend {
                            message: format!("semaphore closed: {e}"),
                        })?;
                let combined = combine_once(&client, &router, timeout, &batch).await?;
                Ok::<SummaryChunk, PipelineError>(SummaryChunk {
                    index: batch_index,
                    summary: combined,
                })
            }));
        }

        let mut next = Vec::with_capacity(handles.len());
        for handle in handles {
            let reduced = handle.await.map_err(|e| PipelineError::Join {
                message: e.to_string(),
            })??;
            next.push(reduced);
        }
        next.sort_by_key(|s| s.index);
        Ok(next)
    }

    async fn combine(&self, summaries: &[SummaryChunk]) -> Result<String, ClientError> {
        combine_once(&self.client, &self.router, self.timeout, summaries).await
    }
}

async fn combine_once(
    client: &Arc<dyn LlmClient>,
    router: &Arc<ModelRouter>,
    timeout: Duration,
    summaries: &[SummaryChunk],
) -> Result<String, ClientError> {
    let config = RouterConfig::new(
        TaskKind::Summarization,
        Priority::Balanced,
        Complexity::Medium,
    );
    let selection = router.select(&config).map_err(|e| ClientError::ApiRequest {
        message: e.to_string(),
        status: None,
    })?;

    let request = ChatRequest {
        model: selection.backend.clone(),
        messages: vec![
            system_message(COMBINE_SYSTEM_PROMPT),
            user_message(&build_combine_prompt(summaries)),
        ],
        temperature: Some(0.2),
        max_tokens: Some(MAX_OUTPUT_TOKENS),
        json_mode: false,
        stream: false,
    };

    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, client.chat(&request)).await;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let result = match outcome {
        Ok(Ok(response)) => Ok(response.content.trim().to_string()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ClientError::DeadlineExceeded {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    };

    router
        .telemetry()
        .update(&selection.backend, latency_ms, result.is_ok());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::message::{ChatRequest, ChatResponse, TokenUsage};
    use crate::client::provider::TextStream;
    use crate::pipeline::extraction::{
        ExtractionChunk, PersonMention, RelationshipMention,
    };
    use crate::router::{BackendDescriptor, CapabilityTier};
    use crate::telemetry::TelemetryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn extraction(index: usize, people: Vec<PersonMention>) -> ChunkResult {
        ChunkResult::Extraction(ExtractionChunk {
            index,
            people,
            ..ExtractionChunk::default()
        })
    }

    #[test]
    fn test_merge_people_case_insensitive_first_seen_display() {
        let a = extraction(
            3,
            vec![PersonMention {
                name: "Alice".to_string(),
                role: None,
            }],
        );
        let b = extraction(
            7,
            vec![PersonMention {
                name: "alice".to_string(),
                role: Some("CEO".to_string()),
            }],
        );
        let report = merge_extractions([&a, &b]);
        assert_eq!(report.people.len(), 1);
        let person = &report.people[0];
        assert_eq!(person.name, "Alice");
        assert_eq!(person.role.as_deref(), Some("CEO"));
        assert_eq!(person.chunks, vec![3, 7]);
    }

    #[test]
    fn test_merge_scalar_first_nonempty_wins() {
        let a = extraction(
            0,
            vec![PersonMention {
                name: "Bob".to_string(),
                role: Some("CTO".to_string()),
            }],
        );
        let b = extraction(
            1,
            vec![PersonMention {
                name: "BOB".to_string(),
                role: Some("intern".to_string()),
            }],
        );
        let report = merge_extractions([&a, &b]);
        assert_eq!(report.people[0].role.as_deref(), Some("CTO"));
    }

    #[test]
    fn test_merge_relationships_dedup_and_evidence() {
        let rel = |index: usize, evidence: &str| {
            ChunkResult::Extraction(ExtractionChunk {
                index,
                relationships: vec![RelationshipMention {
                    person1: "Alice".to_string(),
                    person2: "bob".to_string(),
                    relationship_type: "Manages".to_string(),
                    evidence: evidence.to_string(),
                }],
                ..ExtractionChunk::default()
            })
        };
        let a = rel(0, "Alice manages Bob.");
        let b = rel(1, "Alice manages Bob.");
        let c = rel(2, "Bob reports weekly.");
        let report = merge_extractions([&a, &b, &c]);
        assert_eq!(report.relationships.len(), 1);
        let r = &report.relationships[0];
        assert_eq!(r.evidence, "Alice manages Bob.; Bob reports weekly.");
        assert_eq!(r.chunks, vec![0, 1, 2]);
    }

    #[test]
    fn test_merge_evidence_superstring_replaces() {
        let mut evidence = "manages Bob".to_string();
        merge_evidence(&mut evidence, "Alice manages Bob daily.");
        assert_eq!(evidence, "Alice manages Bob daily.");
        merge_evidence(&mut evidence, "manages Bob");
        assert_eq!(evidence, "Alice manages Bob daily.");
    }

    #[test]
    fn test_merge_counts_failed_chunks() {
        let ok = extraction(0, Vec::new());
        let failed = ChunkResult::Failed(FailedChunk {
            index: 1,
            error: "backend error".to_string(),
        });
        let report = merge_extractions([&ok, &failed]);
        assert_eq!(report.failed_chunks.len(), 1);
        assert_eq!(report.failed_chunks[0].index, 1);
    }

    #[test]
    fn test_merge_is_deterministic() {
        let results: Vec<ChunkResult> = (0..6)
            .map(|i| {
                extraction(
                    i,
                    vec![PersonMention {
                        name: format!("Person {}", i % 3),
                        role: None,
                    }],
                )
            })
            .collect();
        let refs: Vec<&ChunkResult> = results.iter().collect();
        let first = merge_extractions(refs.clone());
        for _ in 0..5 {
            assert_eq!(merge_extractions(refs.clone()), first);
        }
    }

    /// Combines by echoing how many `<summary>` blocks it received.
    struct CountingClient {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl crate::client::LlmClient for CountingClient {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let inputs = request
                .messages
                .iter()
                .map(|m| m.content.matches("<summary>").count())
                .sum::<usize>();
            Ok(ChatResponse {
                content: format!("combined({inputs})"),
                usage: TokenUsage::default(),
                finish_reason: Some("stop".to_string()),
            })
        }

        async fn chat_stream(&self, _request: &ChatRequest) -> Result<TextStream, ClientError> {
            Err(ClientError::Stream {
                message: "not streamed in tests".to_string(),
            })
        }
    }

    fn test_router() -> Arc<ModelRouter> {
        let descriptors = vec![BackendDescriptor {
            name: "combine-model".to_string(),
            capability_tier: CapabilityTier::Standard,
            base_cost_per_1k_tokens: 0.03,
            nominal_max_latency_ms: 1000,
            supports_structured_output: true,
            supports_streaming: true,
        }];
        let telemetry = Arc::new(TelemetryStore::in_memory(&descriptors));
        Arc::new(ModelRouter::new(descriptors, telemetry, "combine-model"))
    }

    fn summaries(n: usize) -> Vec<SummaryChunk> {
        (0..n)
            .map(|i| SummaryChunk {
                index: i,
                summary: format!("part {i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_reduce_small_set_single_call() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
        });
        let reducer = HierarchicalReducer::new(
            Arc::clone(&client) as Arc<dyn LlmClient>,
            test_router(),
            3,
            Duration::from_secs(5),
        );
        let out = reducer
            .reduce(summaries(4))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(out, "combined(4)");
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reduce_large_set_batches_then_recurses() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
        });
        let reducer = HierarchicalReducer::new(
            Arc::clone(&client) as Arc<dyn LlmClient>,
            test_router(),
            3,
            Duration::from_secs(5),
        );
        // 12 inputs: one round of [5, 5, 2], then a final combine of 3.
        let out = reducer
            .reduce(summaries(12))
            .await
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(out, "combined(3)");
        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_reduce_degenerate_inputs() {
        let client = Arc::new(CountingClient {
            calls: AtomicUsize::new(0),
        });
        let reducer = HierarchicalReducer::new(
            Arc::clone(&client) as Arc<dyn LlmClient>,
            test_router(),
            3,
            Duration::from_secs(5),
        );
        assert_eq!(
            reducer.reduce(Vec::new()).await.unwrap_or_default(),
            ""
        );
        let single = vec![SummaryChunk {
            index: 0,
            summary: "only one".to_string(),
        }];
        assert_eq!(
            reducer.reduce(single).await.unwrap_or_default(),
            "only one"
        );
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
