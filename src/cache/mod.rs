//! Result caching behind a uniform adapter contract.
//!
//! Two variants implement the same trait: an in-process map with a
//! periodic sweep, and a remote key/value store reached over HTTP.
//! Exactly one adapter is selected at init (remote when credentials are
//! configured, in-process otherwise) and shared process-wide. Caching is
//! best-effort everywhere: a failing cache degrades reads to misses and
//! writes to no-ops, and never takes the serving path down with it.

pub mod memory;
pub mod remote;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::AppConfig;
use crate::error::CacheError;

pub use memory::MemoryCache;
pub use remote::RemoteCache;

/// Uniform get/set/del contract with per-entry TTL.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Adapter kind, `"memory"` or `"remote"`.
    fn kind(&self) -> &'static str;

    /// Fetches a value. Expired entries are never returned.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] only for encoding problems; transport
    /// failures on reads degrade to `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Stores a value, overwriting any previous entry and resetting its
    /// expiry to `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the store rejects the write.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    /// Deletes a value if present.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] when the store rejects the delete.
    async fn del(&self, key: &str) -> Result<(), CacheError>;

    /// Number of live entries, when the adapter can count them cheaply.
    async fn entry_count(&self) -> Option<usize>;
}

/// Selects and installs the process-wide cache adapter.
///
/// Remote credentials present at init select the remote variant; the
/// in-process map is the fallback. The choice is fixed for the process
/// lifetime; there is no dynamic swap.
#[must_use]
pub fn select_adapter(config: &AppConfig) -> Arc<dyn CacheAdapter> {
    match (&config.remote_cache_url, &config.remote_cache_token) {
        (Some(url), Some(token)) => {
            info!(url = %url, "using remote cache");
            Arc::new(RemoteCache::new(url.clone(), token.clone()))
        }
        _ => {
            info!("using in-process cache");
            let cache = Arc::new(MemoryCache::new());
            // The sweep task needs a runtime; outside one (tests, dry
            // runs) lazy expiry on read still holds the contract.
            if tokio::runtime::Handle::try_current().is_ok() {
                cache.spawn_sweeper(memory::SWEEP_INTERVAL);
            }
            cache
        }
    }
}

/// Builds a stable cache key from a namespace and payload parts.
///
/// Parts are length-prefixed before hashing so `("ab", "c")` and
/// `("a", "bc")` produce distinct keys.
#[must_use]
pub fn hashed_key(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(u64::try_from(part.len()).unwrap_or(u64::MAX).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{namespace}:{hex}")
}
