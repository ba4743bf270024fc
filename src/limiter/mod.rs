//! Sliding-window rate limiting per client identifier.
//!
//! Counters live in the shared [`CacheAdapter`] so the limit holds
//! across processes when the remote cache is installed. The limiter
//! fails open: a stalled counter store must not deny the legitimate
//! traffic that caused the stall.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::CacheAdapter;
use crate::error::CacheError;

/// Request budget for one window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Requests allowed per window.
    pub max_requests: u32,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Configured window budget.
    pub limit: u32,
    /// Requests left in the current window.
    pub remaining: u32,
    /// Epoch milliseconds when the window resets.
    pub reset_at_ms: u64,
}

impl RateLimitDecision {
    /// Whole seconds until the window resets, rounded up, as for a
    /// `Retry-After` header.
    #[must_use]
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms).div_ceil(1000)
    }
}

/// Stored window counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowEntry {
    count: u32,
    reset_at_ms: u64,
}

/// Derives a client identifier from transport metadata.
///
/// First non-empty of: the first `forwarded-for` token, the `real-ip`
/// value, the transport peer address, or the literal `"unknown"`.
#[must_use]
pub fn client_identifier(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer_addr: Option<&str>,
) -> String {
    let forwarded = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let real = real_ip.map(str::trim).filter(|s| !s.is_empty());
    let peer = peer_addr.map(str::trim).filter(|s| !s.is_empty());

    forwarded
        .or(real)
        .or(peer)
        .unwrap_or("unknown")
        .to_string()
}

/// Sliding-window counter built atop the cache adapter.
pub struct RateLimiter {
    cache: Arc<dyn CacheAdapter>,
    namespace: String,
}

impl RateLimiter {
    /// Creates a limiter storing counters under `namespace`.
    #[must_use]
    pub fn new(cache: Arc<dyn CacheAdapter>, namespace: impl Into<String>) -> Self {
        Self {
            cache,
            namespace: namespace.into(),
        }
    }

    /// Checks and consumes one request slot for `client_id`.
    pub async fn check(&self, client_id: &str, policy: RateLimitPolicy) -> RateLimitDecision {
        self.check_at(client_id, policy, epoch_ms()).await
    }

    /// [`check`](Self::check) with an explicit clock, for deterministic tests.
    pub async fn check_at(
        &self,
        client_id: &str,
        policy: RateLimitPolicy,
        now_ms: u64,
    ) -> RateLimitDecision {
        match self.try_check(client_id, policy, now_ms).await {
            Ok(decision) => decision,
            Err(e) => {
                // Fail open: a broken counter store must not DoS traffic.
                warn!(error = %e, client_id, "rate limit storage failed, allowing request");
                RateLimitDecision {
                    allowed: true,
                    limit: policy.max_requests,
                    remaining: policy.max_requests,
                    reset_at_ms: now_ms + window_ms(policy),
                }
            }
        }
    }

    async fn try_check(
        &self,
        client_id: &str,
        policy: RateLimitPolicy,
        now_ms: u64,
    ) -> Result<RateLimitDecision, CacheError> {
        let key = format!(
            "{}:{client_id}:{}",
            self.namespace,
            policy.window.as_secs()
        );

        let existing: Option<WindowEntry> = match self.cache.get(&key).await? {
            Some(bytes) => serde_json::from_slice(&bytes).ok(),
            None => None,
        };

        // A lapsed entry is logically discarded and recreated.
        let entry = existing.filter(|e| now_ms < e.reset_at_ms);

        let decision = match entry {
            None => {
                let fresh = WindowEntry {
                    count: 1,
                    reset_at_ms: now_ms + window_ms(policy),
                };
                self.write_entry(&key, fresh, policy.window).await?;
                RateLimitDecision {
                    allowed: true,
                    limit: policy.max_requests,
                    remaining: policy.max_requests.saturating_sub(1),
                    reset_at_ms: fresh.reset_at_ms,
                }
            }
            Some(e) if e.count >= policy.max_requests => RateLimitDecision {
                allowed: false,
                limit: policy.max_requests,
                remaining: 0,
                reset_at_ms: e.reset_at_ms,
            },
            Some(e) => {
                let bumped = WindowEntry {
                    count: e.count + 1,
                    reset_at_ms: e.reset_at_ms,
                };
                // TTL covers the remainder of the window, rounded up.
                let remaining_ms = e.reset_at_ms.saturating_sub(now_ms);
                let ttl = Duration::from_secs(remaining_ms.div_ceil(1000));
                self.write_entry(&key, bumped, ttl).await?;
                RateLimitDecision {
                    allowed: true,
                    limit: policy.max_requests,
                    remaining: policy.max_requests.saturating_sub(bumped.count),
                    reset_at_ms: e.reset_at_ms,
                }
            }
        };

        Ok(decision)
    }

    async fn write_entry(
        &self,
        key: &str,
        entry: WindowEntry,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(&entry).map_err(|e| CacheError::Encoding {
            message: e.to_string(),
        })?;
        self.cache.set(key, bytes, ttl).await
    }
}

fn window_ms(policy: RateLimitPolicy) -> u64 {
    u64::try_from(policy.window.as_millis()).unwrap_or(u64::MAX)
}

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryCache::new()), "rl")
    }

    const POLICY: RateLimitPolicy = RateLimitPolicy {
        max_requests: 3,
        window: Duration::from_secs(60),
    };

    #[tokio::test]
    async fn test_allows_up_to_max_then_blocks() {
        let limiter = limiter();
        let t0 = 1_000_000;

        for (i, expected_remaining) in [(0u64, 2u32), (1, 1), (2, 0)] {
            let d = limiter.check_at("10.0.0.1", POLICY, t0 + i * 1000).await;
            assert!(d.allowed, "request {i} should be allowed");
            assert_eq!(d.remaining, expected_remaining);
        }

        let d = limiter.check_at("10.0.0.1", POLICY, t0 + 3000).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reset_at_ms, t0 + 60_000);
        // Fourth request at t0+3s: window resets at t0+60s, so ~57s away.
        assert_eq!(d.retry_after_secs(t0 + 3000), 57);
    }

    #[tokio::test]
    async fn test_window_expiry_recreates_entry() {
        let limiter = limiter();
        let t0 = 1_000_000;

        for i in 0..3 {
            limiter.check_at("ip", POLICY, t0 + i).await;
        }
        assert!(!limiter.check_at("ip", POLICY, t0 + 100).await.allowed);

        // Past the reset the entry is logically discarded.
        let d = limiter.check_at("ip", POLICY, t0 + 60_000).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, POLICY.max_requests - 1);
        assert_eq!(d.reset_at_ms, t0 + 120_000);
    }

    #[tokio::test]
    async fn test_identifiers_are_independent() {
        let limiter = limiter();
        let t0 = 1_000_000;

        for i in 0..3 {
            limiter.check_at("a", POLICY, t0 + i).await;
        }
        assert!(!limiter.check_at("a", POLICY, t0 + 10).await.allowed);
        assert!(limiter.check_at("b", POLICY, t0 + 10).await.allowed);
    }

    #[tokio::test]
    async fn test_fails_open_on_storage_error() {
        struct BrokenCache;

        #[async_trait::async_trait]
        impl CacheAdapter for BrokenCache {
            fn kind(&self) -> &'static str {
                "broken"
            }
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
                Err(CacheError::Transport {
                    message: "down".to_string(),
                })
            }
            async fn set(
                &self,
                _key: &str,
                _value: Vec<u8>,
                _ttl: Duration,
            ) -> Result<(), CacheError> {
                Err(CacheError::Transport {
                    message: "down".to_string(),
                })
            }
            async fn del(&self, _key: &str) -> Result<(), CacheError> {
                Ok(())
            }
            async fn entry_count(&self) -> Option<usize> {
                None
            }
        }

        let limiter = RateLimiter::new(Arc::new(BrokenCache), "rl");
        let d = limiter.check_at("ip", POLICY, 5000).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, POLICY.max_requests);
    }

    #[test]
    fn test_client_identifier_precedence() {
        assert_eq!(
            client_identifier(Some("1.2.3.4, 5.6.7.8"), Some("9.9.9.9"), Some("p")),
            "1.2.3.4"
        );
        assert_eq!(client_identifier(None, Some(" 9.9.9.9 "), Some("p")), "9.9.9.9");
        assert_eq!(client_identifier(Some("  "), None, Some("10.1.1.1:443")), "10.1.1.1:443");
        assert_eq!(client_identifier(None, None, None), "unknown");
        assert_eq!(client_identifier(Some(""), Some(""), Some("")), "unknown");
    }
}
