//! Distributed mutual exclusion on top of the cache substrate.
//!
//! Acquisition is a compare-and-set of a random holder token with a TTL
//! strictly above the expected critical-section duration; release is a
//! compare-and-delete with the same token, so a holder can never release a
//! lock that expired and was re-acquired by someone else. In degraded cache
//! mode the same path runs against the in-process store and mutual
//! exclusion holds within one instance only.

use crate::cache::CacheStore;
use crate::error::CoreError;
use crate::utils::codes;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone)]
pub struct DistributedLock {
    cache: Arc<dyn CacheStore>,
}

impl DistributedLock {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Try to acquire `resource` within `timeout`. The lock auto-expires
    /// after `ttl`, which must exceed the expected hold time. Never blocks
    /// past the deadline and never grants a lock it cannot guarantee: a
    /// substrate failure is reported as unavailable, not as acquired.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> Result<LockGuard, CoreError> {
        let key = format!("lock:{}", resource);
        let token = codes::generate_token(16);
        let deadline = Instant::now() + timeout;

        loop {
            match self.cache.compare_and_set(&key, None, &token, ttl).await {
                Ok(true) => {
                    return Ok(LockGuard {
                        cache: self.cache.clone(),
                        key,
                        token,
                        released: false,
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(resource, error = %e, "Lock substrate failed, denying acquisition");
                    return Err(CoreError::LockUnavailable(resource.to_string()));
                }
            }

            if Instant::now() + RETRY_INTERVAL >= deadline {
                return Err(CoreError::LockUnavailable(resource.to_string()));
            }
            sleep(RETRY_INTERVAL).await;
        }
    }
}

/// Held lock. Release explicitly; a dropped guard schedules a best-effort
/// release, and the TTL bounds the damage if that never runs.
pub struct LockGuard {
    cache: Arc<dyn CacheStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<(), CoreError> {
        self.released = true;
        let deleted = self.cache.compare_and_delete(&self.key, &self.token).await?;
        if !deleted {
            tracing::warn!(key = %self.key, "Lock expired before release");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let cache = self.cache.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = cache.compare_and_delete(&key, &token).await;
            });
        }
    }
}
