//! Command-line argument parsing.
//!
//! Defines the CLI structure using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::chunking::{DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP};

/// switchboard-rs: LLM request-orchestration substrate.
///
/// Routes work to the cheapest-adequate backend, runs chunked
/// map/reduce pipelines over large documents, and serves a moderation
/// endpoint with rate limiting and result caching.
#[derive(Parser, Debug)]
#[command(name = "switchboard-rs")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory for persisted telemetry, routing history, and
    /// pipeline checkpoints.
    ///
    /// Defaults to `.switchboard` in the current directory.
    #[arg(short, long, env = "SWB_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, default_value = "text", global = true)]
    pub format: String,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect how a file would be chunked.
    ///
    /// Prints chunk boundaries without calling any backend.
    #[command(after_help = r#"Examples:
  switchboard-rs chunk report.txt                    # Default chunking
  switchboard-rs chunk report.txt --size 4000        # Smaller chunks
  switchboard-rs chunk report.txt --preview          # Include content preview
  switchboard-rs --format json chunk report.txt | jq '.[].byte_start'
"#)]
    Chunk {
        /// File to chunk.
        file: PathBuf,

        /// Chunk size in bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        size: usize,

        /// Overlap between consecutive chunks in bytes.
        #[arg(long, default_value_t = DEFAULT_OVERLAP)]
        overlap: usize,

        /// Include a content preview per chunk.
        #[arg(short, long)]
        preview: bool,
    },

    /// Extract entities from a document via the map/reduce pipeline.
    ///
    /// Chunks the document, routes each chunk to a backend, retries
    /// transient failures, and merges per-chunk entities into one
    /// deduplicated report. Progress is checkpointed; exit code 1 with
    /// a preserved state file means a rerun with --resume continues.
    #[command(after_help = r#"Examples:
  switchboard-rs extract filing.txt                  # Fresh run
  switchboard-rs extract filing.txt --resume         # Continue after a crash
  switchboard-rs extract filing.txt -c 5 -o out.json # Wider pool, file output
"#)]
    Extract {
        /// Document to process.
        file: PathBuf,

        /// Resume from the existing checkpoint instead of starting fresh.
        #[arg(long)]
        resume: bool,

        /// Chunk size in bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Overlap between consecutive chunks in bytes.
        #[arg(long, default_value_t = DEFAULT_OVERLAP)]
        overlap: usize,

        /// Maximum concurrent backend calls.
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Retries per chunk after the first attempt.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Write the report to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Summarize a document via the map/reduce pipeline.
    ///
    /// Chunks the document, summarizes each chunk, and hierarchically
    /// combines partial summaries until one remains.
    #[command(after_help = r#"Examples:
  switchboard-rs summarize transcript.txt
  switchboard-rs summarize transcript.txt --resume
  switchboard-rs summarize transcript.txt --chunk-size 8000 -c 5
"#)]
    Summarize {
        /// Document to process.
        file: PathBuf,

        /// Resume from the existing checkpoint instead of starting fresh.
        #[arg(long)]
        resume: bool,

        /// Chunk size in bytes.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Overlap between consecutive chunks in bytes.
        #[arg(long, default_value_t = DEFAULT_OVERLAP)]
        overlap: usize,

        /// Maximum concurrent backend calls.
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Write the summary to a file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Dry-run a routing decision.
    ///
    /// Scores the configured backends for a task/priority pair and
    /// prints the selection with alternatives. The decision is recorded
    /// in routing history exactly as in live traffic.
    #[command(after_help = r#"Examples:
  switchboard-rs route --task classification --priority cost
  switchboard-rs route --task reasoning --priority quality --max-latency-ms 5000
  switchboard-rs route --task chat --require structured_output --require streaming
"#)]
    Route {
        /// Task kind: classification, summarization, reasoning,
        /// extraction, chat, other.
        #[arg(long, default_value = "classification")]
        task: String,

        /// Priority: cost, quality, speed, balanced.
        #[arg(long, default_value = "balanced")]
        priority: String,

        /// Complexity: low, medium, high.
        #[arg(long, default_value = "medium")]
        complexity: String,

        /// Latency budget in milliseconds.
        #[arg(long)]
        max_latency_ms: Option<u64>,

        /// Required capability (repeatable): structured_output, streaming.
        #[arg(long)]
        require: Vec<String>,
    },

    /// Print router statistics from persisted telemetry.
    Stats,

    /// Serve the moderation HTTP endpoint.
    #[command(after_help = r#"Examples:
  switchboard-rs serve                         # 127.0.0.1:8080
  switchboard-rs serve --port 9090
  switchboard-rs serve --host 0.0.0.0 --port 8080
"#)]
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind.
        #[arg(short, long, default_value_t = 8080)]
        port: u16,
    },
}
