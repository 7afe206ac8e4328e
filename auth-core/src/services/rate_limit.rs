//! Distributed rate limiting over the cache substrate.
//!
//! Every strategy runs on atomic substrate operations; there is no
//! read-then-write window for concurrent requests to slip through. The
//! limiter fails closed: when the substrate errors, the request is denied
//! with a conservative retry hint.

use crate::cache::CacheStore;
use crate::error::CoreError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// CAS attempts for the token-bucket state before denying conservatively.
const BUCKET_CAS_RETRIES: usize = 5;
/// How long a run of window exhaustions is remembered.
const EXHAUSTION_MEMORY: Duration = Duration::from_secs(3600);
/// Ceiling for escalated retry hints.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitStrategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

impl RateLimitStrategy {
    fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::FixedWindow => "fixed",
            RateLimitStrategy::SlidingWindow => "sliding",
            RateLimitStrategy::TokenBucket => "bucket",
        }
    }
}

/// Outcome of a limit check. `remaining` is the budget left in the current
/// window after this request.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub retry_after: Option<Duration>,
}

impl RateDecision {
    fn allowed(remaining: i64) -> Self {
        Self {
            allowed: true,
            remaining: remaining.max(0),
            retry_after: None,
        }
    }

    fn denied(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after: Some(retry_after),
        }
    }
}

/// Token-bucket persistent state.
#[derive(Debug, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    cache: Arc<dyn CacheStore>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Check and consume one unit of budget for `key`. The bound is
    /// inclusive: request number `limit` within a window is allowed, the
    /// next one is denied. Denials do not consume budget.
    pub async fn check(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        strategy: RateLimitStrategy,
    ) -> RateDecision {
        match self.check_inner(key, limit, window, strategy).await {
            Ok(decision) => decision,
            Err(e) => {
                // Fail closed: a broken substrate makes the limiter
                // conservative, never permissive.
                tracing::warn!(key, error = %e, "Rate limit substrate failed, denying");
                RateDecision::denied(window)
            }
        }
    }

    /// Like [`check`], but window exhaustions escalate the retry hint:
    /// each exhaustion within the memory period doubles it, up to a cap.
    ///
    /// [`check`]: RateLimiter::check
    pub async fn check_escalating(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        strategy: RateLimitStrategy,
    ) -> RateDecision {
        let decision = self.check(key, limit, window, strategy).await;
        if decision.allowed {
            return decision;
        }

        let exhaust_key = format!("ratelimit:exhaust:{}", key);
        let exhaustions = self
            .cache
            .increment(&exhaust_key, EXHAUSTION_MEMORY)
            .await
            .unwrap_or(1)
            .clamp(1, 16);

        let base = decision.retry_after.unwrap_or(window);
        let escalated = base
            .saturating_mul(1 << (exhaustions - 1).min(10) as u32)
            .min(MAX_RETRY_AFTER);
        RateDecision::denied(escalated)
    }

    /// Clear the budget and escalation history for `key`, e.g. after a
    /// successful authentication.
    pub async fn reset(&self, key: &str) -> Result<(), CoreError> {
        self.cache
            .delete_by_prefix(&format!("ratelimit:fixed:{}:", key))
            .await?;
        self.cache
            .delete_by_prefix(&format!("ratelimit:sliding:{}:", key))
            .await?;
        self.cache
            .delete(&format!("ratelimit:bucket:{}", key))
            .await?;
        self.cache
            .delete(&format!("ratelimit:exhaust:{}", key))
            .await?;
        Ok(())
    }

    /// Convenience wrapper mapping a denial into `RateLimitExceeded`.
    pub async fn enforce(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        strategy: RateLimitStrategy,
    ) -> Result<(), CoreError> {
        let decision = self.check(key, limit, window, strategy).await;
        if decision.allowed {
            Ok(())
        } else {
            Err(CoreError::RateLimitExceeded {
                retry_after: decision.retry_after.unwrap_or(window),
            })
        }
    }

    async fn check_inner(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        strategy: RateLimitStrategy,
    ) -> Result<RateDecision, CoreError> {
        match strategy {
            RateLimitStrategy::FixedWindow => self.check_fixed(key, limit, window).await,
            RateLimitStrategy::SlidingWindow => self.check_sliding(key, limit, window).await,
            RateLimitStrategy::TokenBucket => self.check_bucket(key, limit, window).await,
        }
    }

    async fn check_fixed(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, CoreError> {
        let window_secs = window.as_secs().max(1) as i64;
        let now = Utc::now().timestamp();
        let bucket = now / window_secs;

        let cache_key = format!("ratelimit:fixed:{}:{}", key, bucket);
        let count = self.cache.increment(&cache_key, window).await?;

        if count <= i64::from(limit) {
            Ok(RateDecision::allowed(i64::from(limit) - count))
        } else {
            self.cache.decrement(&cache_key).await?;
            let window_ends = (bucket + 1) * window_secs;
            Ok(RateDecision::denied(Duration::from_secs(
                (window_ends - now).max(1) as u64,
            )))
        }
    }

    async fn check_sliding(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, CoreError> {
        let window_ms = window.as_millis().max(1) as i64;
        let now_ms = Utc::now().timestamp_millis();
        let bucket = now_ms / window_ms;

        let curr_key = format!("ratelimit:sliding:{}:{}", key, bucket);
        let prev_key = format!("ratelimit:sliding:{}:{}", key, bucket - 1);

        // Both adjacent windows must outlive the trailing interval.
        let curr = self
            .cache
            .increment(&curr_key, window.saturating_mul(2))
            .await?;
        let prev: i64 = match self.cache.get(&prev_key).await? {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };

        let elapsed_fraction = (now_ms - bucket * window_ms) as f64 / window_ms as f64;
        let weighted = prev as f64 * (1.0 - elapsed_fraction) + curr as f64;

        if weighted <= f64::from(limit) {
            Ok(RateDecision::allowed(
                (f64::from(limit) - weighted).floor() as i64
            ))
        } else {
            self.cache.decrement(&curr_key).await?;
            // The trailing estimate decays linearly; waiting out the rest of
            // the current bucket is always sufficient.
            let remainder_ms = window_ms - (now_ms - bucket * window_ms);
            Ok(RateDecision::denied(Duration::from_millis(
                remainder_ms.max(1) as u64,
            )))
        }
    }

    async fn check_bucket(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateDecision, CoreError> {
        let cache_key = format!("ratelimit:bucket:{}", key);
        let capacity = f64::from(limit.max(1));
        let refill_per_sec = capacity / window.as_secs_f64().max(0.001);
        let state_ttl = window.saturating_mul(2);

        for _ in 0..BUCKET_CAS_RETRIES {
            let now_ms = Utc::now().timestamp_millis();
            let current = self.cache.get(&cache_key).await?;

            let (expected, state) = match &current {
                None => (
                    None,
                    BucketState {
                        tokens: capacity,
                        last_refill_ms: now_ms,
                    },
                ),
                Some(raw) => {
                    let stored: BucketState = serde_json::from_str(raw)
                        .map_err(|e| CoreError::Cache(anyhow::anyhow!("bucket state: {}", e)))?;
                    let elapsed = (now_ms - stored.last_refill_ms).max(0) as f64 / 1000.0;
                    (
                        Some(raw.as_str()),
                        BucketState {
                            tokens: (stored.tokens + elapsed * refill_per_sec).min(capacity),
                            last_refill_ms: now_ms,
                        },
                    )
                }
            };

            if state.tokens < 1.0 {
                // Denials consume nothing, so the stored state can stay as
                // it is.
                let wait = ((1.0 - state.tokens) / refill_per_sec).max(0.001);
                return Ok(RateDecision::denied(Duration::from_secs_f64(wait)));
            }

            let next = BucketState {
                tokens: state.tokens - 1.0,
                last_refill_ms: state.last_refill_ms,
            };
            let serialized = serde_json::to_string(&next)
                .map_err(|e| CoreError::Cache(anyhow::anyhow!("bucket state: {}", e)))?;

            if self
                .cache
                .compare_and_set(&cache_key, expected, &serialized, state_ttl)
                .await?
            {
                return Ok(RateDecision::allowed(next.tokens.floor() as i64));
            }
            // Lost the CAS race, retry against the fresh state.
        }

        Ok(RateDecision::denied(window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new(256)))
    }

    #[tokio::test]
    async fn fixed_window_allows_exactly_limit() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        for i in 0..5 {
            let decision = limiter
                .check("login:1.2.3.4", 5, window, RateLimitStrategy::FixedWindow)
                .await;
            assert!(decision.allowed, "request {} should pass", i + 1);
        }

        let denied = limiter
            .check("login:1.2.3.4", 5, window, RateLimitStrategy::FixedWindow)
            .await;
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());
    }

    #[tokio::test]
    async fn fixed_window_denials_do_not_consume_budget() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            limiter
                .check("k", 5, window, RateLimitStrategy::FixedWindow)
                .await;
        }
        for _ in 0..10 {
            let denied = limiter
                .check("k", 5, window, RateLimitStrategy::FixedWindow)
                .await;
            assert!(!denied.allowed);
        }

        // The counter must still sit exactly at the limit, not beyond it.
        let store = limiter.cache.clone();
        let bucket = Utc::now().timestamp() / 60;
        let raw = store
            .get(&format!("ratelimit:fixed:k:{}", bucket))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, "5");
    }

    #[tokio::test]
    async fn fixed_window_resets_after_window() {
        let limiter = limiter();
        let window = Duration::from_millis(500);

        for _ in 0..2 {
            assert!(
                limiter
                    .check("k", 2, window, RateLimitStrategy::FixedWindow)
                    .await
                    .allowed
            );
        }
        assert!(
            !limiter
                .check("k", 2, window, RateLimitStrategy::FixedWindow)
                .await
                .allowed
        );

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(
            limiter
                .check("k", 2, window, RateLimitStrategy::FixedWindow)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn sliding_window_counts_trailing_interval() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(
                limiter
                    .check("k", 3, window, RateLimitStrategy::SlidingWindow)
                    .await
                    .allowed
            );
        }
        assert!(
            !limiter
                .check("k", 3, window, RateLimitStrategy::SlidingWindow)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let limiter = limiter();
        let window = Duration::from_millis(400);

        for _ in 0..2 {
            assert!(
                limiter
                    .check("k", 2, window, RateLimitStrategy::TokenBucket)
                    .await
                    .allowed
            );
        }
        let denied = limiter
            .check("k", 2, window, RateLimitStrategy::TokenBucket)
            .await;
        assert!(!denied.allowed);

        // Half a window refills one token.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(
            limiter
                .check("k", 2, window, RateLimitStrategy::TokenBucket)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(limiter());
        let window = Duration::from_secs(60);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .check("burst", 5, window, RateLimitStrategy::FixedWindow)
                    .await
                    .allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn reset_restores_the_full_budget() {
        let limiter = limiter();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            limiter
                .check("k", 3, window, RateLimitStrategy::SlidingWindow)
                .await;
        }
        assert!(
            !limiter
                .check("k", 3, window, RateLimitStrategy::SlidingWindow)
                .await
                .allowed
        );

        limiter.reset("k").await.unwrap();
        assert!(
            limiter
                .check("k", 3, window, RateLimitStrategy::SlidingWindow)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn escalation_grows_retry_hint() {
        let limiter = limiter();
        let window = Duration::from_secs(10);

        // A zero budget denies every attempt, so each check is an exhaustion.
        let first = limiter
            .check_escalating("k", 0, window, RateLimitStrategy::FixedWindow)
            .await;
        let second = limiter
            .check_escalating("k", 0, window, RateLimitStrategy::FixedWindow)
            .await;
        let third = limiter
            .check_escalating("k", 0, window, RateLimitStrategy::FixedWindow)
            .await;

        assert!(!first.allowed && !second.allowed && !third.allowed);
        assert!(second.retry_after.unwrap() > first.retry_after.unwrap() / 2);
        assert!(third.retry_after.unwrap() > second.retry_after.unwrap());
    }
}
