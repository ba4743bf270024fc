//! Error types for switchboard-rs.
//!
//! Each subsystem owns a small `thiserror` enum; outer layers convert
//! transport specifics into these taxonomies instead of leaking SDK or
//! HTTP error types. The CLI boundary collapses everything into
//! [`CommandError`].

use thiserror::Error;

/// Result alias used by CLI command implementations.
pub type Result<T> = std::result::Result<T, CommandError>;

/// Errors from LLM backend clients and schema validation.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No API key was found in configuration or environment.
    #[error("API key missing: set OPENAI_API_KEY or SWB_API_KEY")]
    ApiKeyMissing,

    /// The configured provider name has no registered implementation.
    #[error("unsupported provider: {name}")]
    UnsupportedProvider {
        /// The unrecognized provider name.
        name: String,
    },

    /// The backend API call failed (network, 4xx/5xx, SDK error).
    #[error("API request failed: {message}")]
    ApiRequest {
        /// Human-readable failure description.
        message: String,
        /// HTTP status code, when the transport exposed one.
        status: Option<u16>,
    },

    /// A streaming response failed mid-flight.
    #[error("stream failed: {message}")]
    Stream {
        /// Human-readable failure description.
        message: String,
    },

    /// The call exceeded its deadline.
    #[error("request deadline exceeded after {timeout_ms}ms")]
    DeadlineExceeded {
        /// The deadline that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The model output did not satisfy the declared schema.
    #[error("schema validation failed: {message}")]
    SchemaValidation {
        /// What the validator rejected.
        message: String,
        /// The raw model output, kept for diagnostics and hand-parsing.
        content: String,
    },
}

impl ClientError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Schema validation failures are treated as transient for one retry;
    /// the caller enforces that budget.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ApiRequest { .. }
                | Self::Stream { .. }
                | Self::DeadlineExceeded { .. }
                | Self::SchemaValidation { .. }
        )
    }
}

/// Errors from cache adapters.
///
/// Callers treat these as advisory: reads degrade to a miss, writes to
/// a no-op. Nothing in the serving path propagates a `CacheError` to a
/// client.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store could not be reached or refused the operation.
    #[error("cache transport error: {message}")]
    Transport {
        /// Human-readable failure description.
        message: String,
    },

    /// A value could not be encoded or decoded.
    #[error("cache encoding error: {message}")]
    Encoding {
        /// Human-readable failure description.
        message: String,
    },
}

/// Errors from the telemetry store.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A state file could not be read or created.
    #[error("telemetry I/O error at {path}: {message}")]
    Io {
        /// File the operation touched.
        path: String,
        /// Underlying failure description.
        message: String,
    },

    /// A state file held unparseable JSON.
    #[error("telemetry parse error at {path}: {message}")]
    Parse {
        /// File the operation touched.
        path: String,
        /// Underlying failure description.
        message: String,
    },
}

/// Errors from the model router.
#[derive(Debug, Error)]
pub enum RouterError {
    /// A required capability excluded every configured backend.
    ///
    /// This is a configuration error and is surfaced to the caller;
    /// there is no silent fallback past a capability requirement.
    #[error("no backend satisfies required capabilities: {missing}")]
    NoEligibleBackend {
        /// The capabilities that could not be satisfied.
        missing: String,
    },
}

/// Errors from the chunk pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A transient backend failure (timeout, 5xx, provider rate limit).
    #[error("backend error: {message}")]
    Backend {
        /// Human-readable failure description.
        message: String,
    },

    /// The model's structured output failed validation.
    #[error("schema error: {message}")]
    Schema {
        /// Human-readable failure description.
        message: String,
    },

    /// A checkpoint could not be read or written.
    #[error("checkpoint error: {message}")]
    Checkpoint {
        /// Human-readable failure description.
        message: String,
    },

    /// The run was cancelled before completion.
    #[error("pipeline cancelled")]
    Cancelled,

    /// The caller supplied unusable input (empty document, bad policy).
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Human-readable failure description.
        message: String,
    },

    /// A worker task panicked or was aborted.
    #[error("worker join failed: {message}")]
    Join {
        /// Human-readable failure description.
        message: String,
    },
}

impl From<ClientError> for PipelineError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::SchemaValidation { message, .. } => Self::Schema { message },
            other => Self::Backend {
                message: other.to_string(),
            },
        }
    }
}

/// Errors from the moderation serving path.
#[derive(Debug, Error)]
pub enum ModerationError {
    /// The client exceeded its request budget for the current window.
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited {
        /// Configured window budget.
        limit: u32,
        /// Epoch milliseconds when the window resets.
        reset_at_ms: u64,
        /// Whole seconds until the window resets.
        retry_after_secs: u64,
    },

    /// The request body was missing or ill-typed.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request.
        message: String,
    },

    /// Routing failed due to a configuration error.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Streaming setup failed before any bytes were sent.
    #[error("stream setup failed: {message}")]
    Stream {
        /// Human-readable failure description.
        message: String,
    },
}

/// Errors surfaced at the CLI boundary.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The arguments were syntactically valid but unusable.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The command started but could not complete.
    #[error("{0}")]
    ExecutionFailed(String),

    /// File I/O failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<ClientError> for CommandError {
    fn from(e: ClientError) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

impl From<RouterError> for CommandError {
    fn from(e: RouterError) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

impl From<TelemetryError> for CommandError {
    fn from(e: TelemetryError) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

impl From<PipelineError> for CommandError {
    fn from(e: PipelineError) -> Self {
        Self::ExecutionFailed(e.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(e: serde_json::Error) -> Self {
        Self::ExecutionFailed(format!("JSON error: {e}"))
    }
}
