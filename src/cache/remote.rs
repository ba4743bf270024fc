//! Remote key/value cache adapter.
//!
//! Forwards to an external store over HTTP, selected at init when
//! `REMOTE_CACHE_URL` and `REMOTE_CACHE_TOKEN` are both present. Reads
//! fail open: any transport failure degrades to a miss so caching stays
//! best-effort. Writes and deletes surface a [`CacheError`] which
//! callers log and otherwise ignore.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::CacheAdapter;
use crate::error::CacheError;

/// Overall deadline for a single cache round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client for a remote key/value store.
///
/// Keys are hex-encoded into the URL path, so arbitrary key bytes
/// (hashes, `{id}:{window}` limiter keys) stay path-safe.
pub struct RemoteCache {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl RemoteCache {
    /// Creates an adapter for the store at `base_url`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            http,
        }
    }

    fn key_url(&self, key: &str) -> String {
        let encoded: String = key.bytes().map(|b| format!("{b:02x}")).collect();
        format!("{}/v1/kv/{encoded}", self.base_url)
    }
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache")
            .field("base_url", &self.base_url)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl CacheAdapter for RemoteCache {
    fn kind(&self) -> &'static str {
        "remote"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let response = match self
            .http
            .get(self.key_url(key))
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "remote cache read failed, treating as miss");
                return Ok(None);
            }
        };

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "remote cache read rejected, treating as miss");
            return Ok(None);
        }

        match response.bytes().await {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(e) => {
                warn!(error = %e, "remote cache body read failed, treating as miss");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let response = self
            .http
            .put(self.key_url(key))
            .query(&[("ttl_seconds", ttl.as_secs())])
            .bearer_auth(&self.token)
            .body(value)
            .send()
            .await
            .map_err(|e| CacheError::Transport {
                message: e.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CacheError::Transport {
                message: format!("store rejected write: {}", response.status()),
            })
        }
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let response = self
            .http
            .delete(self.key_url(key))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| CacheError::Transport {
                message: e.to_string(),
            })?;

        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(CacheError::Transport {
                message: format!("store rejected delete: {}", response.status()),
            })
        }
    }

    async fn entry_count(&self) -> Option<usize> {
        None
    }
}
