//! CLI command implementations.
//!
//! Contains the business logic for each CLI command.

// Allow certain patterns that improve readability in CLI output formatting
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::format_push_string)]
#![allow(clippy::too_many_lines)]

use std::fmt::Write as FmtWrite;
use std::io::{self, Write as IoWrite};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::select_adapter;
use crate::chunking::{Chunk, chunk_text, fingerprint};
use crate::client::{LenientValidator, LlmClient, create_client};
use crate::config::AppConfig;
use crate::error::{CommandError, Result};
use crate::http::{AppState, serve};
use crate::limiter::RateLimitPolicy;
use crate::moderation::{LogAlertSink, ModerationService};
use crate::pipeline::{
    CheckpointStore, ChunkProcessor, HierarchicalReducer, LlmExtractor, LlmSummarizer,
    PipelineExecutor, ProcessingState, SummaryChunk, merge_extractions,
};
use crate::router::{
    BackendDescriptor, Capability, Complexity, ModelRouter, Priority, RouterConfig, TaskKind,
    default_backends, load_descriptors,
};
use crate::stats::{StatsConfig, StatsProjector};
use crate::telemetry::TelemetryStore;

use super::parser::{Cli, Commands};

/// Output format for command results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CommandError::InvalidArguments(format!(
                "unknown format '{other}' (expected text or json)"
            ))),
        }
    }
}

/// Executes the parsed CLI command.
///
/// # Errors
///
/// Returns [`CommandError`] on any failure; the binary maps this to
/// exit code 1 with state files preserved.
pub async fn run(cli: Cli) -> Result<()> {
    let format = OutputFormat::parse(&cli.format)?;
    let mut config = AppConfig::from_env();
    if let Some(state_dir) = cli.state_dir {
        config.state_dir = state_dir;
    }

    match cli.command {
        Commands::Chunk {
            file,
            size,
            overlap,
            preview,
        } => cmd_chunk(&file, size, overlap, preview, format),
        Commands::Extract {
            file,
            resume,
            chunk_size,
            overlap,
            concurrency,
            max_retries,
            output,
        } => {
            if let Some(c) = concurrency {
                config.concurrency = c;
            }
            if let Some(r) = max_retries {
                config.max_retries = r;
            }
            cmd_extract(&config, &file, resume, chunk_size, overlap, output.as_deref()).await
        }
        Commands::Summarize {
            file,
            resume,
            chunk_size,
            overlap,
            concurrency,
            output,
        } => {
            if let Some(c) = concurrency {
                config.concurrency = c;
            }
            cmd_summarize(&config, &file, resume, chunk_size, overlap, output.as_deref()).await
        }
        Commands::Route {
            task,
            priority,
            complexity,
            max_latency_ms,
            require,
        } => cmd_route(
            &config,
            &task,
            &priority,
            &complexity,
            max_latency_ms,
            &require,
            format,
        ),
        Commands::Stats => cmd_stats(&config, format),
        Commands::Serve { host, port } => cmd_serve(config, &host, port).await,
    }
}

// ==================== chunk ====================

fn cmd_chunk(
    file: &Path,
    size: usize,
    overlap: usize,
    preview: bool,
    format: OutputFormat,
) -> Result<()> {
    if size == 0 {
        return Err(CommandError::InvalidArguments(
            "--size must be greater than zero".to_string(),
        ));
    }
    let text = read_document(file)?;
    let chunks = chunk_text(&text, size, overlap);

    match format {
        OutputFormat::Json => {
            let rows: Vec<serde_json::Value> = chunks
                .iter()
                .map(|c| {
                    let mut row = serde_json::json!({
                        "index": c.index,
                        "byte_start": c.byte_range.start,
                        "byte_end": c.byte_range.end,
                        "len": c.len(),
                    });
                    if preview {
                        row["preview"] = serde_json::Value::String(preview_of(&c.text));
                    }
                    row
                })
                .collect();
            emit(&serde_json::to_string_pretty(&rows)?)
        }
        OutputFormat::Text => {
            let mut out = String::new();
            let _ = writeln!(
                out,
                "{} chunks from {} bytes (size={}, overlap={}, fingerprint={})",
                chunks.len(),
                text.len(),
                size,
                overlap,
                fingerprint(&text)
            );
            for c in &chunks {
                let _ = writeln!(
                    out,
                    "  [{}] bytes {}..{} ({} bytes)",
                    c.index, c.byte_range.start, c.byte_range.end, c.len()
                );
                if preview {
                    let _ = writeln!(out, "      {}", preview_of(&c.text));
                }
            }
            emit(&out)
        }
    }
}

// ==================== extract / summarize ====================

struct PipelineSetup {
    chunks: Vec<Chunk>,
    source_fingerprint: String,
    executor: PipelineExecutor,
    client: Arc<dyn LlmClient>,
    router: Arc<ModelRouter>,
}

fn build_pipeline(
    config: &AppConfig,
    file: &Path,
    resume: bool,
    chunk_size: usize,
    overlap: usize,
) -> Result<PipelineSetup> {
    if chunk_size == 0 {
        return Err(CommandError::InvalidArguments(
            "--chunk-size must be greater than zero".to_string(),
        ));
    }
    let text = read_document(file)?;
    let chunks = chunk_text(&text, chunk_size, overlap);
    if chunks.is_empty() {
        return Err(CommandError::InvalidArguments(format!(
            "{} contains no usable text",
            file.display()
        )));
    }

    let client = create_client(config)?;
    let (router, _telemetry) = open_router(config)?;

    let checkpoints = CheckpointStore::new(&config.state_dir);
    if !resume {
        checkpoints.clear();
    }
    let executor = PipelineExecutor::new(config.pipeline_policy(), checkpoints);

    // Ctrl-c stops dispatch and checkpoints in-flight progress.
    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling pipeline");
            cancel.cancel();
        }
    });

    Ok(PipelineSetup {
        source_fingerprint: fingerprint(&text),
        chunks,
        executor,
        client,
        router,
    })
}

fn report_run(state: &ProcessingState) -> Result<()> {
    if state.resume_may_be_incomplete {
        warn!("one or more checkpoint writes failed; a resume may redo finished chunks");
    }
    if !state.is_finished() {
        return Err(CommandError::ExecutionFailed(format!(
            "run cancelled with {}/{} chunks done; state file preserved, rerun with --resume",
            state.completed.len() + state.failed.len(),
            state.total_chunks
        )));
    }
    Ok(())
}

async fn cmd_extract(
    config: &AppConfig,
    file: &Path,
    resume: bool,
    chunk_size: usize,
    overlap: usize,
    output: Option<&Path>,
) -> Result<()> {
    let setup = build_pipeline(config, file, resume, chunk_size, overlap)?;

    let processor: Arc<dyn ChunkProcessor> = Arc::new(LlmExtractor::new(
        Arc::clone(&setup.client),
        Arc::clone(&setup.router),
        Arc::new(LenientValidator),
        config.call_timeout,
    ));

    info!(
        chunks = setup.chunks.len(),
        concurrency = config.concurrency,
        "starting extraction"
    );
    let state = setup
        .executor
        .run(&setup.source_fingerprint, &setup.chunks, processor)
        .await?;
    report_run(&state)?;

    let report = merge_extractions(state.all_results());
    let rendered = serde_json::to_string_pretty(&report)?;
    write_output(output, &rendered)?;

    if report.failed_chunks.is_empty() {
        Ok(())
    } else {
        Err(CommandError::ExecutionFailed(format!(
            "{} of {} chunks failed; state file preserved, rerun with --resume",
            report.failed_chunks.len(),
            state.total_chunks
        )))
    }
}

async fn cmd_summarize(
    config: &AppConfig,
    file: &Path,
    resume: bool,
    chunk_size: usize,
    overlap: usize,
    output: Option<&Path>,
) -> Result<()> {
    let setup = build_pipeline(config, file, resume, chunk_size, overlap)?;

    let processor: Arc<dyn ChunkProcessor> = Arc::new(LlmSummarizer::new(
        Arc::clone(&setup.client),
        Arc::clone(&setup.router),
        config.call_timeout,
    ));

    info!(
        chunks = setup.chunks.len(),
        concurrency = config.concurrency,
        "starting summarization"
    );
    let state = setup
        .executor
        .run(&setup.source_fingerprint, &setup.chunks, processor)
        .await?;
    report_run(&state)?;

    let summaries: Vec<SummaryChunk> = state
        .all_results()
        .into_iter()
        .filter_map(|r| match r {
            crate::pipeline::ChunkResult::Summary(s) => Some(s.clone()),
            _ => None,
        })
        .collect();
    let failed = state.failed.len();

    let reducer = HierarchicalReducer::new(
        setup.client,
        setup.router,
        config.concurrency,
        config.call_timeout,
    );
    let summary = reducer.reduce(summaries).await?;
    write_output(output, &summary)?;

    if failed == 0 {
        Ok(())
    } else {
        Err(CommandError::ExecutionFailed(format!(
            "{failed} of {} chunks failed; state file preserved, rerun with --resume",
            state.total_chunks
        )))
    }
}

// ==================== route ====================

fn parse_task(s: &str) -> Result<TaskKind> {
    match s.to_lowercase().as_str() {
        "classification" => Ok(TaskKind::Classification),
        "summarization" => Ok(TaskKind::Summarization),
        "reasoning" => Ok(TaskKind::Reasoning),
        "extraction" => Ok(TaskKind::Extraction),
        "chat" => Ok(TaskKind::Chat),
        "other" => Ok(TaskKind::Other),
        other => Err(CommandError::InvalidArguments(format!(
            "unknown task '{other}'"
        ))),
    }
}

fn parse_priority(s: &str) -> Result<Priority> {
    match s.to_lowercase().as_str() {
        "cost" => Ok(Priority::Cost),
        "quality" => Ok(Priority::Quality),
        "speed" => Ok(Priority::Speed),
        "balanced" => Ok(Priority::Balanced),
        other => Err(CommandError::InvalidArguments(format!(
            "unknown priority '{other}'"
        ))),
    }
}

fn parse_complexity(s: &str) -> Result<Complexity> {
    match s.to_lowercase().as_str() {
        "low" => Ok(Complexity::Low),
        "medium" => Ok(Complexity::Medium),
        "high" => Ok(Complexity::High),
        other => Err(CommandError::InvalidArguments(format!(
            "unknown complexity '{other}'"
        ))),
    }
}

fn parse_capability(s: &str) -> Result<Capability> {
    match s.to_lowercase().as_str() {
        "structured_output" => Ok(Capability::StructuredOutput),
        "streaming" => Ok(Capability::Streaming),
        other => Err(CommandError::InvalidArguments(format!(
            "unknown capability '{other}'"
        ))),
    }
}

fn cmd_route(
    config: &AppConfig,
    task: &str,
    priority: &str,
    complexity: &str,
    max_latency_ms: Option<u64>,
    require: &[String],
    format: OutputFormat,
) -> Result<()> {
    let mut router_config =
        RouterConfig::new(parse_task(task)?, parse_priority(priority)?, parse_complexity(complexity)?);
    if let Some(ms) = max_latency_ms {
        router_config = router_config.with_max_latency_ms(ms);
    }
    for capability in require {
        router_config = router_config.require(parse_capability(capability)?);
    }

    let (router, _telemetry) = open_router(config)?;
    let selection = router.select(&router_config)?;

    match format {
        OutputFormat::Json => emit(&serde_json::to_string_pretty(&selection)?),
        OutputFormat::Text => {
            let mut out = String::new();
            let _ = writeln!(
                out,
                "selected: {} (score {:.1})",
                selection.backend, selection.score
            );
            let _ = writeln!(out, "reason:   {}", selection.reason);
            if !selection.alternatives.is_empty() {
                let _ = writeln!(out, "alternatives:");
                for alt in &selection.alternatives {
                    let _ = writeln!(
                        out,
                        "  {} (score {:.1}) {}",
                        alt.backend, alt.score, alt.reason
                    );
                }
            }
            emit(&out)
        }
    }
}

// ==================== stats ====================

fn cmd_stats(config: &AppConfig, format: OutputFormat) -> Result<()> {
    let (_router, telemetry) = open_router(config)?;
    let projector = StatsProjector::new(
        telemetry,
        StatsConfig {
            assumed_tokens_per_call: config.assumed_tokens_per_call,
        },
    );
    let report = projector.report();

    match format {
        OutputFormat::Json => emit(&serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            let mut out = String::new();
            let _ = writeln!(
                out,
                "decisions: {}   backends: {}   calls: {}   success rate: {:.1}%",
                report.summary.total_decisions,
                report.summary.backends_tracked,
                report.summary.total_calls,
                report.summary.overall_success_rate * 100.0
            );
            let _ = writeln!(out, "\nbackend comparison:");
            for row in &report.comparison {
                let _ = writeln!(
                    out,
                    "  {:<28} {:<10} ${:<7.3} {:>8.0}ms  {:>6.1}%  calls={:<5} selected={}",
                    row.backend,
                    row.tier,
                    row.cost_per_1k_tokens,
                    row.avg_latency_ms,
                    row.success_rate * 100.0,
                    row.call_count,
                    row.times_selected
                );
            }
            if !report.timeline.is_empty() {
                let _ = writeln!(out, "\nrecent decisions:");
                for entry in &report.timeline {
                    let _ = writeln!(
                        out,
                        "  {}  {:<14} {:<9} -> {} ({:.1})",
                        entry.ts, entry.task, entry.priority, entry.selected_backend, entry.score
                    );
                }
            }
            emit(&out)
        }
    }
}

// ==================== serve ====================

async fn cmd_serve(config: AppConfig, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| CommandError::InvalidArguments(format!("bad bind address: {e}")))?;

    let client = create_client(&config)?;
    let (router, telemetry) = open_router(&config)?;
    let cache = select_adapter(&config);

    let service = Arc::new(ModerationService::new(
        cache,
        Arc::clone(&router),
        client,
        Arc::new(LenientValidator),
        Arc::new(LogAlertSink),
        RateLimitPolicy {
            max_requests: config.rate_limit_max_requests,
            window: config.rate_limit_window,
        },
        config.result_ttl,
        config.call_timeout,
    ));
    let stats = Arc::new(StatsProjector::new(
        telemetry,
        StatsConfig {
            assumed_tokens_per_call: config.assumed_tokens_per_call,
        },
    ));

    serve(addr, AppState { service, stats })
        .await
        .map_err(|e| CommandError::ExecutionFailed(format!("server failed: {e}")))
}

// ==================== shared helpers ====================

fn open_router(config: &AppConfig) -> Result<(Arc<ModelRouter>, Arc<TelemetryStore>)> {
    let descriptors: Vec<BackendDescriptor> = match &config.backends_path {
        Some(path) => load_descriptors(path)?,
        None => default_backends(),
    };
    let telemetry = Arc::new(TelemetryStore::open(&config.state_dir, &descriptors)?);
    let router = Arc::new(ModelRouter::new(
        descriptors,
        Arc::clone(&telemetry),
        config.default_backend.clone(),
    ));
    Ok((router, telemetry))
}

fn read_document(file: &Path) -> Result<String> {
    std::fs::read_to_string(file)
        .map_err(|e| CommandError::Io(format!("{}: {e}", file.display())))
}

fn write_output(output: Option<&Path>, content: &str) -> Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, content)
                .map_err(|e| CommandError::Io(format!("{}: {e}", path.display())))?;
            info!(path = %path.display(), "output written");
            Ok(())
        }
        None => emit(content),
    }
}

/// Writes command output to stdout in one locked write.
fn emit(content: &str) -> Result<()> {
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    handle
        .write_all(content.as_bytes())
        .and_then(|()| {
            if content.ends_with('\n') {
                Ok(())
            } else {
                handle.write_all(b"\n")
            }
        })
        .map_err(|e| CommandError::ExecutionFailed(format!("failed to write to stdout: {e}")))
}

const PREVIEW_LEN: usize = 72;

fn preview_of(text: &str) -> String {
    let flat = text.replace(['\n', '\r'], " ");
    if flat.len() <= PREVIEW_LEN {
        return flat;
    }
    let mut cut = PREVIEW_LEN;
    while cut > 0 && !flat.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &flat[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!(
            OutputFormat::parse("text").unwrap_or_else(|_| unreachable!()),
            OutputFormat::Text
        );
        assert_eq!(
            OutputFormat::parse("json").unwrap_or_else(|_| unreachable!()),
            OutputFormat::Json
        );
        assert!(OutputFormat::parse("yaml").is_err());
    }

    #[test]
    fn test_parse_router_arguments() {
        assert!(parse_task("Reasoning").is_ok());
        assert!(parse_task("guessing").is_err());
        assert!(parse_priority("COST").is_ok());
        assert!(parse_priority("vibes").is_err());
        assert!(parse_complexity("high").is_ok());
        assert!(parse_capability("streaming").is_ok());
        assert!(parse_capability("telepathy").is_err());
    }

    #[test]
    fn test_preview_truncates() {
        let preview = preview_of(&"word ".repeat(40));
        assert!(preview.len() <= PREVIEW_LEN + '…'.len_utf8());
        assert!(preview.ends_with('…'));
    }
}
