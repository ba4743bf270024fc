//! Bounded-concurrency map phase.
//!
//! Executes a per-chunk processor over all pending chunks with a
//! semaphore-capped worker pool. Each chunk retries with exponential
//! backoff, degrades to the processor's fallback when retries are
//! exhausted, and finally records a synthetic failure so the reducer
//! still counts the chunk. Every terminal outcome is checkpointed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{CheckpointStore, ProcessingState};
use super::{ChunkResult, FailedChunk};
use crate::chunking::Chunk;
use crate::error::PipelineError;

/// Execution policy for the map phase.
#[derive(Debug, Clone, Copy)]
pub struct PipelinePolicy {
    /// Maximum concurrently executing chunk tasks.
    pub concurrency: usize,
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `n` is `base_delay * 2^n`.
    pub base_delay: std::time::Duration,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: 3,
            base_delay: std::time::Duration::from_millis(500),
        }
    }
}

/// Maps one chunk to a [`ChunkResult`].
///
/// `process` is the primary map function; `fallback` is the degraded
/// variant invoked once the retry budget is spent. The default fallback
/// declines, which turns the chunk into a synthetic failure record.
#[async_trait]
pub trait ChunkProcessor: Send + Sync {
    /// Maps a chunk to its result.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for transient backend failures and
    /// schema-validation failures; both are retried.
    async fn process(&self, chunk: &Chunk) -> Result<ChunkResult, PipelineError>;

    /// Degraded map function used after retries are exhausted.
    async fn fallback(&self, _chunk: &Chunk, _error: &PipelineError) -> Option<ChunkResult> {
        None
    }
}

enum Outcome {
    /// Primary or fallback result for the chunk.
    Completed(usize, ChunkResult),
    /// Retries and fallback both failed.
    Failed(usize, String),
    /// Dispatch or retry was abandoned due to cancellation.
    Skipped(usize),
}

/// Runs the map phase with checkpointed resumability.
pub struct PipelineExecutor {
    policy: PipelinePolicy,
    checkpoints: CheckpointStore,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    /// Creates an executor with a fresh cancellation token.
    #[must_use]
    pub fn new(policy: PipelinePolicy, checkpoints: CheckpointStore) -> Self {
        Self {
            policy,
            checkpoints,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels this executor's runs.
    ///
    /// Cancelling stops dispatch of new chunks and asks in-flight chunks
    /// to abort at their next retry boundary; the current checkpoint is
    /// always written before `run` returns.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Executes `processor` over every chunk not already completed in
    /// the checkpoint for `fingerprint`.
    ///
    /// Failed chunks from a previous run are retried; completed chunks
    /// are skipped. Returns the final state, which the caller inspects
    /// for failures and cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] only for setup failures; per-chunk
    /// errors are folded into the state as failures.
    pub async fn run(
        &self,
        fingerprint: &str,
        chunks: &[Chunk],
        processor: Arc<dyn ChunkProcessor>,
    ) -> Result<ProcessingState, PipelineError> {
        let mut state = match self.checkpoints.load()? {
            Some(existing)
                if existing.source_fingerprint == fingerprint
                    && existing.total_chunks == chunks.len() =>
            {
                info!(
                    completed = existing.completed.len(),
                    failed = existing.failed.len(),
                    "resuming from checkpoint"
                );
                existing
            }
            Some(_) | None => ProcessingState::new(fingerprint, chunks.len()),
        };

        let pending: Vec<Chunk> = chunks
            .iter()
            .filter(|c| !state.is_completed(c.index))
            .cloned()
            .collect();

        // Failed chunks are about to be retried; drop their records so a
        // checkpoint mid-retry does not double-book them.
        for chunk in &pending {
            state.failed.remove(&chunk.index);
            state.failed_results.remove(&chunk.index);
        }

        if pending.is_empty() {
            self.persist(&mut state);
            return Ok(state);
        }

        let semaphore = Arc::new(Semaphore::new(self.policy.concurrency.max(1)));
        let (tx, mut rx) = mpsc::channel::<Outcome>(pending.len());
        let mut handles = Vec::with_capacity(pending.len());

        for chunk in pending {
            let semaphore = Arc::clone(&semaphore);
            let processor = Arc::clone(&processor);
            let cancel = self.cancel.clone();
            let tx = tx.clone();
            let policy = self.policy;

            let index = chunk.index;
            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    let _ = tx.send(Outcome::Skipped(chunk.index)).await;
                    return;
                };
                // Cancellation stops dispatch of chunks that have not
                // started yet.
                if cancel.is_cancelled() {
                    let _ = tx.send(Outcome::Skipped(chunk.index)).await;
                    return;
                }
                let outcome = run_chunk(&chunk, processor.as_ref(), &cancel, policy).await;
                let _ = tx.send(outcome).await;
            });
            handles.push((index, handle));
        }
        drop(tx);

        let total = state.total_chunks;
        while let Some(outcome) = rx.recv().await {
            match outcome {
                Outcome::Completed(index, result) => {
                    state.record_completed(index, result);
                    info!(
                        chunk = index,
                        done = state.completed.len(),
                        total,
                        "chunk completed"
                    );
                }
                Outcome::Failed(index, error) => {
                    warn!(chunk = index, error = %error, "chunk failed terminally");
                    state.record_failed(index, ChunkResult::Failed(FailedChunk { index, error }));
                }
                Outcome::Skipped(index) => {
                    debug!(chunk = index, "chunk skipped by cancellation");
                    continue;
                }
            }
            self.persist(&mut state);
        }

        for (index, handle) in handles {
            if let Err(e) = handle.await
                && !state.is_completed(index)
            {
                warn!(chunk = index, error = %e, "worker join failed");
                state.record_failed(
                    index,
                    ChunkResult::Failed(FailedChunk {
                        index,
                        error: format!("worker join failed: {e}"),
                    }),
                );
                self.persist(&mut state);
            }
        }

        // A cancelled run still leaves a current checkpoint behind.
        self.persist(&mut state);
        Ok(state)
    }

    fn persist(&self, state: &mut ProcessingState) {
        if let Err(e) = self.checkpoints.save(state) {
            warn!(error = %e, "checkpoint write failed, resume may be incomplete");
            state.resume_may_be_incomplete = true;
        }
    }
}

/// Per-chunk lifecycle: attempt, backoff, retry, fallback.
///
/// Retries happen on the same worker slot; the semaphore permit is held
/// by the caller for the whole lifecycle.
async fn run_chunk(
    chunk: &Chunk,
    processor: &dyn ChunkProcessor,
    cancel: &CancellationToken,
    policy: PipelinePolicy,
) -> Outcome {
    let mut attempt: u32 = 0;
    loop {
        match processor.process(chunk).await {
            Ok(result) => return Outcome::Completed(chunk.index, result),
            Err(error) => {
                if attempt < policy.max_retries {
                    let delay = policy
                        .base_delay
                        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
                    debug!(
                        chunk = chunk.index,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "chunk attempt failed, backing off"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Outcome::Skipped(chunk.index),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                } else {
                    match processor.fallback(chunk, &error).await {
                        Some(result) => {
                            debug!(chunk = chunk.index, "fallback produced degraded result");
                            return Outcome::Completed(chunk.index, result);
                        }
                        None => return Outcome::Failed(chunk.index, error.to_string()),
                    }
                }
            }
        }
    }
}
