//! Application configuration with builder pattern and environment
//! variable support.
//!
//! Configuration is resolved in order: explicit values → environment
//! variables → defaults. No field is mandatory at build time; the API
//! key is checked where a live client is actually constructed.

use std::path::PathBuf;
use std::time::Duration;

use crate::limiter::RateLimitPolicy;
use crate::pipeline::PipelinePolicy;

/// Default state directory for persisted telemetry and checkpoints.
const DEFAULT_STATE_DIR: &str = ".switchboard";
/// Default backend used when the table is empty or a fallback is needed.
const DEFAULT_BACKEND: &str = "gpt-5-mini-2025-08-07";
/// Default requests per rate-limit window.
const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
/// Default rate-limit window in seconds.
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
/// Default concurrent LLM calls in the map phase.
const DEFAULT_CONCURRENCY: usize = 3;
/// Default retries per chunk after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base backoff delay in milliseconds.
const DEFAULT_BASE_DELAY_MS: u64 = 500;
/// Default per-call deadline in seconds.
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
/// Default TTL for cached moderation verdicts in seconds.
const DEFAULT_RESULT_TTL_SECS: u64 = 3600;
/// Default tokens-per-call assumption for cost extrapolation.
const DEFAULT_TOKENS_PER_CALL: u64 = 100;

/// Application-wide configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// LLM provider name (e.g., "openai").
    pub provider: String,
    /// API key for the provider, when configured.
    pub api_key: Option<String>,
    /// Optional base URL override (for proxies or compatible APIs).
    pub base_url: Option<String>,
    /// Directory for telemetry, history, and checkpoint files.
    pub state_dir: PathBuf,
    /// Optional JSON file overriding the compiled-in backend table.
    pub backends_path: Option<PathBuf>,
    /// Backend returned when the table is empty.
    pub default_backend: String,
    /// Remote cache endpoint; with the token, selects the remote cache.
    pub remote_cache_url: Option<String>,
    /// Remote cache bearer token.
    pub remote_cache_token: Option<String>,
    /// Requests allowed per rate-limit window.
    pub rate_limit_max_requests: u32,
    /// Rate-limit window length.
    pub rate_limit_window: Duration,
    /// Maximum concurrent LLM calls in the map phase.
    pub concurrency: usize,
    /// Retries per chunk after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `n` is `base_delay * 2^n`.
    pub base_delay: Duration,
    /// Deadline for a single LLM call.
    pub call_timeout: Duration,
    /// TTL for cached moderation verdicts.
    pub result_ttl: Duration,
    /// Tokens assumed per call when estimating spend.
    pub assumed_tokens_per_call: u64,
}

impl AppConfig {
    /// Creates a new builder.
    #[must_use]
    pub fn builder() -> AppConfigBuilder {
        AppConfigBuilder::default()
    }

    /// Configuration from environment variables with defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::builder().from_env().build()
    }

    /// Rate-limit policy derived from this configuration.
    #[must_use]
    pub const fn limit_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            max_requests: self.rate_limit_max_requests,
            window: self.rate_limit_window,
        }
    }

    /// Pipeline execution policy derived from this configuration.
    #[must_use]
    pub const fn pipeline_policy(&self) -> PipelinePolicy {
        PipelinePolicy {
            concurrency: self.concurrency,
            max_retries: self.max_retries,
            base_delay: self.base_delay,
        }
    }
}

/// Builder for [`AppConfig`].
#[derive(Debug, Clone, Default)]
pub struct AppConfigBuilder {
    provider: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    state_dir: Option<PathBuf>,
    backends_path: Option<PathBuf>,
    default_backend: Option<String>,
    remote_cache_url: Option<String>,
    remote_cache_token: Option<String>,
    rate_limit_max_requests: Option<u32>,
    rate_limit_window: Option<Duration>,
    concurrency: Option<usize>,
    max_retries: Option<u32>,
    base_delay: Option<Duration>,
    call_timeout: Option<Duration>,
    result_ttl: Option<Duration>,
    assumed_tokens_per_call: Option<u64>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.trim().parse().ok())
}

impl AppConfigBuilder {
    /// Populates unset fields from environment variables.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if self.provider.is_none() {
            self.provider = env_var("SWB_PROVIDER");
        }
        if self.api_key.is_none() {
            self.api_key = env_var("OPENAI_API_KEY").or_else(|| env_var("SWB_API_KEY"));
        }
        if self.base_url.is_none() {
            self.base_url = env_var("OPENAI_BASE_URL").or_else(|| env_var("SWB_BASE_URL"));
        }
        if self.state_dir.is_none() {
            self.state_dir = env_var("SWB_STATE_DIR").map(PathBuf::from);
        }
        if self.backends_path.is_none() {
            self.backends_path = env_var("SWB_BACKENDS_PATH").map(PathBuf::from);
        }
        if self.default_backend.is_none() {
            self.default_backend = env_var("SWB_DEFAULT_BACKEND");
        }
        if self.remote_cache_url.is_none() {
            self.remote_cache_url = env_var("REMOTE_CACHE_URL");
        }
        if self.remote_cache_token.is_none() {
            self.remote_cache_token = env_var("REMOTE_CACHE_TOKEN");
        }
        if self.rate_limit_max_requests.is_none() {
            self.rate_limit_max_requests = env_parse("RATE_LIMIT_MAX_REQUESTS");
        }
        if self.rate_limit_window.is_none() {
            self.rate_limit_window =
                env_parse::<u64>("RATE_LIMIT_WINDOW_SECONDS").map(Duration::from_secs);
        }
        if self.concurrency.is_none() {
            self.concurrency = env_parse("SWB_CONCURRENCY");
        }
        if self.max_retries.is_none() {
            self.max_retries = env_parse("SWB_MAX_RETRIES");
        }
        if self.base_delay.is_none() {
            self.base_delay = env_parse::<u64>("SWB_BASE_DELAY_MS").map(Duration::from_millis);
        }
        if self.call_timeout.is_none() {
            self.call_timeout =
                env_parse::<u64>("SWB_CALL_TIMEOUT_SECS").map(Duration::from_secs);
        }
        if self.result_ttl.is_none() {
            self.result_ttl = env_parse::<u64>("SWB_RESULT_TTL_SECS").map(Duration::from_secs);
        }
        if self.assumed_tokens_per_call.is_none() {
            self.assumed_tokens_per_call = env_parse("SWB_TOKENS_PER_CALL");
        }
        self
    }

    /// Sets the LLM provider name.
    #[must_use]
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the base URL override.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the state directory.
    #[must_use]
    pub fn state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Sets the backend table file.
    #[must_use]
    pub fn backends_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.backends_path = Some(path.into());
        self
    }

    /// Sets the fallback backend.
    #[must_use]
    pub fn default_backend(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }

    /// Sets both remote cache credentials.
    #[must_use]
    pub fn remote_cache(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.remote_cache_url = Some(url.into());
        self.remote_cache_token = Some(token.into());
        self
    }

    /// Sets the rate-limit budget per window.
    #[must_use]
    pub const fn rate_limit_max_requests(mut self, n: u32) -> Self {
        self.rate_limit_max_requests = Some(n);
        self
    }

    /// Sets the rate-limit window.
    #[must_use]
    pub const fn rate_limit_window(mut self, window: Duration) -> Self {
        self.rate_limit_window = Some(window);
        self
    }

    /// Sets the map-phase concurrency.
    #[must_use]
    pub const fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = Some(n);
        self
    }

    /// Sets the per-chunk retry budget.
    #[must_use]
    pub const fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    /// Sets the base backoff delay.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Sets the per-call deadline.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Sets the verdict cache TTL.
    #[must_use]
    pub const fn result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = Some(ttl);
        self
    }

    /// Sets the tokens-per-call assumption for cost analysis.
    #[must_use]
    pub const fn assumed_tokens_per_call(mut self, n: u64) -> Self {
        self.assumed_tokens_per_call = Some(n);
        self
    }

    /// Builds the [`AppConfig`].
    #[must_use]
    pub fn build(self) -> AppConfig {
        AppConfig {
            provider: self.provider.unwrap_or_else(|| "openai".to_string()),
            api_key: self.api_key,
            base_url: self.base_url,
            state_dir: self
                .state_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            backends_path: self.backends_path,
            default_backend: self
                .default_backend
                .unwrap_or_else(|| DEFAULT_BACKEND.to_string()),
            remote_cache_url: self.remote_cache_url,
            remote_cache_token: self.remote_cache_token,
            rate_limit_max_requests: self
                .rate_limit_max_requests
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX),
            rate_limit_window: self
                .rate_limit_window
                .unwrap_or(Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS)),
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            max_retries: self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
            base_delay: self
                .base_delay
                .unwrap_or(Duration::from_millis(DEFAULT_BASE_DELAY_MS)),
            call_timeout: self
                .call_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS)),
            result_ttl: self
                .result_ttl
                .unwrap_or(Duration::from_secs(DEFAULT_RESULT_TTL_SECS)),
            assumed_tokens_per_call: self
                .assumed_tokens_per_call
                .unwrap_or(DEFAULT_TOKENS_PER_CALL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = AppConfig::builder().build();
        assert_eq!(config.provider, "openai");
        assert!(config.api_key.is_none());
        assert_eq!(config.state_dir, PathBuf::from(DEFAULT_STATE_DIR));
        assert_eq!(config.rate_limit_max_requests, DEFAULT_RATE_LIMIT_MAX);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.assumed_tokens_per_call, DEFAULT_TOKENS_PER_CALL);
    }

    #[test]
    fn test_builder_custom_values() {
        let config = AppConfig::builder()
            .api_key("key")
            .provider("custom")
            .state_dir("/tmp/swb-test")
            .rate_limit_max_requests(3)
            .rate_limit_window(Duration::from_secs(10))
            .concurrency(7)
            .build();
        assert_eq!(config.provider, "custom");
        assert_eq!(config.api_key.as_deref(), Some("key"));
        assert_eq!(config.limit_policy().max_requests, 3);
        assert_eq!(config.limit_policy().window, Duration::from_secs(10));
        assert_eq!(config.pipeline_policy().concurrency, 7);
    }

    #[test]
    fn test_remote_cache_requires_both_credentials() {
        let config = AppConfig::builder().build();
        assert!(config.remote_cache_url.is_none());
        assert!(config.remote_cache_token.is_none());

        let config = AppConfig::builder()
            .remote_cache("http://cache:7700", "token")
            .build();
        assert!(config.remote_cache_url.is_some());
        assert!(config.remote_cache_token.is_some());
    }
}
