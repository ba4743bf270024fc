//! Pipeline checkpoint state.
//!
//! A single JSON document keyed by the source fingerprint records which
//! chunks reached a terminal outcome. Restarting with the same source
//! skips completed chunks and retries failed ones.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::ChunkResult;
use crate::error::PipelineError;
use crate::limiter::epoch_ms;

/// Checkpoint file name within the state directory.
pub const STATE_FILE: &str = ".extraction-state.json";

/// Progress of one pipeline run over one source document.
///
/// Invariants: `completed` and `failed` are disjoint; every key in
/// `chunk_results` is in `completed`; synthetic results for failed
/// chunks live in `failed_results`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingState {
    /// Fingerprint of the source document.
    pub source_fingerprint: String,
    /// Chunk count for the source.
    pub total_chunks: usize,
    /// Indexes with a successful (possibly degraded) result.
    pub completed: BTreeSet<usize>,
    /// Indexes that exhausted retries and fallback.
    pub failed: BTreeSet<usize>,
    /// Results for completed chunks.
    pub chunk_results: BTreeMap<usize, ChunkResult>,
    /// Synthetic error records for failed chunks.
    #[serde(default)]
    pub failed_results: BTreeMap<usize, ChunkResult>,
    /// Epoch milliseconds when the run started.
    pub start_ts: u64,
    /// Epoch milliseconds of the last state change.
    pub last_update_ts: u64,
    /// Set when a checkpoint write failed mid-run, meaning a resume may
    /// redo work that actually finished.
    #[serde(default)]
    pub resume_may_be_incomplete: bool,
}

impl ProcessingState {
    /// Fresh state for a new run.
    #[must_use]
    pub fn new(source_fingerprint: impl Into<String>, total_chunks: usize) -> Self {
        let now = epoch_ms();
        Self {
            source_fingerprint: source_fingerprint.into(),
            total_chunks,
            completed: BTreeSet::new(),
            failed: BTreeSet::new(),
            chunk_results: BTreeMap::new(),
            failed_results: BTreeMap::new(),
            start_ts: now,
            last_update_ts: now,
            resume_may_be_incomplete: false,
        }
    }

    /// Records a successful result for `index`.
    ///
    /// A chunk that previously failed and then succeeded on a resumed
    /// run moves from `failed` to `completed`.
    pub fn record_completed(&mut self, index: usize, result: ChunkResult) {
        self.failed.remove(&index);
        self.failed_results.remove(&index);
        self.completed.insert(index);
        self.chunk_results.insert(index, result);
        self.last_update_ts = epoch_ms();
    }

    /// Records a terminal failure for `index`.
    ///
    /// Ignored if the chunk already completed; a success is never
    /// downgraded.
    pub fn record_failed(&mut self, index: usize, result: ChunkResult) {
        if self.completed.contains(&index) {
            return;
        }
        self.failed.insert(index);
        self.failed_results.insert(index, result);
        self.last_update_ts = epoch_ms();
    }

    /// Whether `index` already has a successful result.
    #[must_use]
    pub fn is_completed(&self, index: usize) -> bool {
        self.completed.contains(&index)
    }

    /// Whether every chunk reached a terminal outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.completed.len() + self.failed.len() >= self.total_chunks
    }

    /// Completed and synthetic results interleaved in index order.
    #[must_use]
    pub fn all_results(&self) -> Vec<&ChunkResult> {
        let mut merged: BTreeMap<usize, &ChunkResult> = self
            .chunk_results
            .iter()
            .map(|(i, r)| (*i, r))
            .collect();
        for (i, r) in &self.failed_results {
            merged.entry(*i).or_insert(r);
        }
        merged.into_values().collect()
    }
}

/// Loads and writes the checkpoint document.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    /// Store for the checkpoint under `state_dir`.
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    /// Checkpoint file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the active checkpoint, if one exists and parses.
    ///
    /// A corrupt file is logged and treated as absent: losing a resume
    /// point degrades to a full re-run, never a refusal to run.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Checkpoint`] only for I/O failures other
    /// than the file being absent.
    pub fn load(&self) -> Result<Option<ProcessingState>, PipelineError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::Checkpoint {
                    message: format!("{}: {e}", self.path.display()),
                });
            }
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "checkpoint unparseable, starting fresh"
                );
                Ok(None)
            }
        }
    }

    /// Overwrites the checkpoint with `state`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Checkpoint`] when serialization or the
    /// write fails. Callers log this and continue; a lost checkpoint is
    /// reported, not fatal.
    pub fn save(&self, state: &ProcessingState) -> Result<(), PipelineError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::Checkpoint {
                message: format!("{}: {e}", parent.display()),
            })?;
        }
        let bytes = serde_json::to_vec_pretty(state).map_err(|e| PipelineError::Checkpoint {
            message: e.to_string(),
        })?;
        std::fs::write(&self.path, bytes).map_err(|e| PipelineError::Checkpoint {
            message: format!("{}: {e}", self.path.display()),
        })
    }

    /// Removes the checkpoint after a fully successful run.
    pub fn clear(&self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "checkpoint removal failed");
        }
    }
}
