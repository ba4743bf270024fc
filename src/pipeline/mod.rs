//! Chunked map/reduce pipeline.
//!
//! Oversize inputs are split at semantic boundaries, mapped over a
//! bounded worker pool with per-chunk retry and degraded fallback, and
//! reduced into a single aggregate. Progress is checkpointed after every
//! terminal outcome so a crashed run resumes instead of restarting.
//!
//! # Architecture
//!
//! ```text
//! document ──► chunk_text ──► PipelineExecutor (map, bounded pool)
//!   per chunk: route ──► invoke ──► retry/backoff ──► fallback
//!   each terminal outcome ──► ProcessingState ──► CheckpointStore
//! chunk results ──► Reducer (dedup merge | hierarchical combine)
//! ```

pub mod executor;
pub mod extraction;
pub mod reducer;
pub mod state;
pub mod summarize;

use serde::{Deserialize, Serialize};

pub use executor::{ChunkProcessor, PipelineExecutor, PipelinePolicy};
pub use extraction::{
    CompanyMention, ConceptMention, ExtractionChunk, LlmExtractor, PersonMention,
    RelationshipMention,
};
pub use reducer::{ExtractionReport, HierarchicalReducer, merge_extractions};
pub use state::{CheckpointStore, ProcessingState, STATE_FILE};
pub use summarize::{LlmSummarizer, SummaryChunk};

/// Output of mapping one chunk.
///
/// Carries the chunk `index` but never the chunk text; the reducer works
/// purely on extracted structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkResult {
    /// Entities extracted from one chunk.
    Extraction(ExtractionChunk),
    /// Free-form summary of one chunk.
    Summary(SummaryChunk),
    /// Synthetic record for a chunk that exhausted retries and fallback.
    Failed(FailedChunk),
}

impl ChunkResult {
    /// Index of the chunk this result describes.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Extraction(e) => e.index,
            Self::Summary(s) => s.index,
            Self::Failed(f) => f.index,
        }
    }
}

/// Error summary standing in for a chunk that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedChunk {
    /// Index of the failed chunk.
    pub index: usize,
    /// Why the chunk failed, for the aggregate report.
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_result_index_accessor() {
        let failed = ChunkResult::Failed(FailedChunk {
            index: 7,
            error: "backend error".to_string(),
        });
        assert_eq!(failed.index(), 7);
    }

    #[test]
    fn test_chunk_result_tagged_serialization() {
        let summary = ChunkResult::Summary(SummaryChunk {
            index: 2,
            summary: "short".to_string(),
        });
        let json = serde_json::to_string(&summary).unwrap_or_default();
        assert!(json.contains("\"kind\":\"summary\""));
        let back: ChunkResult = serde_json::from_str(&json).unwrap_or_else(|_| unreachable!());
        assert_eq!(back, summary);
    }
}
