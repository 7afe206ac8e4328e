//! Composite store: distributed when reachable, bounded local otherwise.
//!
//! The distributed store is authoritative while healthy. After a run of
//! consecutive failures the substrate flips to the local store and keeps
//! probing the distributed one in the background of regular traffic. The
//! current mode is an observable health signal; dependents must treat
//! degraded mode as unsafe for cross-instance coordination.

use super::{CacheStore, MemoryStore, RedisStore};
use crate::error::CoreError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Consecutive distributed-store failures before flipping to local mode.
const FAILURE_THRESHOLD: u32 = 3;
/// How often a degraded substrate re-tries the distributed store.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Shared store reachable; safe for cross-instance coordination.
    Distributed,
    /// In-process fallback; rate limits and locks are per-instance only.
    DegradedLocal,
}

pub struct HybridCache {
    distributed: Option<RedisStore>,
    local: MemoryStore,
    degraded: AtomicBool,
    consecutive_failures: AtomicU32,
    last_probe: Mutex<Instant>,
}

impl HybridCache {
    /// Build the substrate. `redis_url = None` starts permanently local.
    pub async fn new(redis_url: Option<&str>, fallback_capacity: usize) -> Self {
        let distributed = match redis_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => Some(store),
                Err(e) => {
                    tracing::warn!(error = %e, "Shared store unreachable at startup, entering degraded mode");
                    None
                }
            },
            None => {
                tracing::warn!("No shared store configured; cache substrate is per-instance only");
                None
            }
        };

        let degraded = distributed.is_none();
        Self {
            distributed,
            local: MemoryStore::new(fallback_capacity),
            degraded: AtomicBool::new(degraded),
            consecutive_failures: AtomicU32::new(0),
            last_probe: Mutex::new(Instant::now()),
        }
    }

    /// Build a substrate that only ever uses the in-process store. Intended
    /// for tests and single-instance deployments.
    pub fn local_only(capacity: usize) -> Self {
        Self {
            distributed: None,
            local: MemoryStore::new(capacity),
            degraded: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_probe: Mutex::new(Instant::now()),
        }
    }

    pub fn mode(&self) -> CacheMode {
        if self.degraded.load(Ordering::Relaxed) {
            CacheMode::DegradedLocal
        } else {
            CacheMode::Distributed
        }
    }

    /// The distributed store, when this request should attempt it: always in
    /// healthy mode, and once per probe interval while degraded.
    fn distributed_for_attempt(&self) -> Option<&RedisStore> {
        let store = self.distributed.as_ref()?;
        if !self.degraded.load(Ordering::Relaxed) {
            return Some(store);
        }

        let mut last = match self.last_probe.lock() {
            Ok(guard) => guard,
            Err(_) => return None,
        };
        if last.elapsed() >= PROBE_INTERVAL {
            *last = Instant::now();
            Some(store)
        } else {
            None
        }
    }

    fn note_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.degraded.swap(false, Ordering::Relaxed) {
            tracing::info!("Shared store reachable again, leaving degraded mode");
        }
    }

    fn note_failure(&self, err: &CoreError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILURE_THRESHOLD && !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                error = %err,
                failures,
                "Shared store failing, cache substrate degraded to per-instance mode"
            );
        } else {
            tracing::debug!(error = %err, failures, "Shared store operation failed");
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $op:ident ( $($arg:expr),* )) => {{
        if let Some(store) = $self.distributed_for_attempt() {
            match store.$op($($arg),*).await {
                Ok(value) => {
                    $self.note_success();
                    return Ok(value);
                }
                Err(e) => $self.note_failure(&e),
            }
        }
        $self.local.$op($($arg),*).await
    }};
}

#[async_trait]
impl CacheStore for HybridCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        dispatch!(self, get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError> {
        dispatch!(self, set(key, value, ttl))
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        dispatch!(self, delete(key))
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
        dispatch!(self, delete_by_prefix(prefix))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        dispatch!(self, compare_and_set(key, expected, new, ttl))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoreError> {
        dispatch!(self, compare_and_delete(key, expected))
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, CoreError> {
        dispatch!(self, increment(key, ttl))
    }

    async fn decrement(&self, key: &str) -> Result<i64, CoreError> {
        dispatch!(self, decrement(key))
    }
}
