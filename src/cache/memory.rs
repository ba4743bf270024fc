//! In-process cache: a concurrent map with TTL and a periodic sweep.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use super::CacheAdapter;
use crate::error::CacheError;

/// How often the background sweep evicts expired entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

struct Entry {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// Process-local cache adapter.
///
/// The map lives behind a `std::sync::Mutex` (not tokio) — it is never
/// held across an `.await` point, so blocking acquisition is safe and
/// keeps reads synchronous. Expiry is enforced on read; the sweep only
/// reclaims memory for entries nobody asks for again.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns the periodic sweep task on the current runtime.
    ///
    /// Must be called from within a tokio runtime. The task runs for
    /// the process lifetime; callers keep the returned handle only if
    /// they want to abort it.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = cache.sweep(Instant::now());
                if evicted > 0 {
                    debug!(evicted, "cache sweep evicted expired entries");
                }
            }
        })
    }

    /// Removes entries whose expiry is at or before `now`. Returns the
    /// number of evicted entries.
    pub fn sweep(&self, now: Instant) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheAdapter for MemoryCache {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let Ok(mut entries) = self.entries.lock() else {
            return Ok(None);
        };
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(Some(e.bytes.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            bytes: value,
            expires_at: Instant::now() + ttl,
        };
        let Ok(mut entries) = self.entries.lock() else {
            return Err(CacheError::Transport {
                message: "cache mutex poisoned".to_string(),
            });
        };
        entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
        Ok(())
    }

    async fn entry_count(&self) -> Option<usize> {
        self.entries.lock().map(|e| e.len()).ok()
    }
}
