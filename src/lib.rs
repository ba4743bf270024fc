//! switchboard-rs: an LLM request-orchestration substrate.
//!
//! Given a corpus of work items and a pool of language-model backends
//! with different cost, latency, and capability profiles, this crate
//! selects the cheapest-adequate backend per task, executes work under
//! bounded concurrency with retry and fallback, caches results,
//! enforces per-client rate limits, and aggregates partial outputs via
//! a map/reduce topology. Observed call outcomes feed back into the
//! routing decision.
//!
//! # Architecture
//!
//! ```text
//! Job (unary request | large document)
//!   ├── ModerationService ── rate limit → cache → router → backend
//!   │     └── alerts + rolling metrics
//!   └── PipelineExecutor ── chunker → bounded map → checkpoint
//!         └── Reducer ── dedup merge | hierarchical combine
//!
//! every call ──► ModelRouter::select ──► TelemetryStore (persisted)
//!                      ▲                        │
//!                      └──── scoring loop ──────┘
//! ```
//!
//! State persists as three JSON files under the configured state
//! directory: backend telemetry, a bounded routing history, and the
//! active pipeline checkpoint.

pub mod cache;
pub mod chunking;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod moderation;
pub mod pipeline;
pub mod router;
pub mod stats;
pub mod telemetry;

// Re-export key types
pub use cache::{CacheAdapter, MemoryCache, RemoteCache};
pub use chunking::{Chunk, chunk_text, fingerprint};
pub use client::{LenientValidator, LlmClient, Schema, SchemaValidator, create_client};
pub use config::AppConfig;
pub use error::{
    CacheError, ClientError, CommandError, ModerationError, PipelineError, RouterError,
};
pub use limiter::{RateLimitDecision, RateLimitPolicy, RateLimiter};
pub use moderation::{ModerationRequest, ModerationResult, ModerationService};
pub use pipeline::{ChunkProcessor, ChunkResult, PipelineExecutor, ProcessingState};
pub use router::{ModelRouter, RouterConfig};
pub use stats::StatsProjector;
pub use telemetry::TelemetryStore;
