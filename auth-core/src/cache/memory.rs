//! Bounded single-instance store with least-recently-used eviction.
//!
//! This is the fallback backend: correct within one process only. All
//! operations take the same mutex, which is what makes the conditional
//! primitives atomic here.

use super::CacheStore;
use crate::error::CoreError;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct MemoryStore {
    inner: Mutex<LruCache<String, Entry>>,
}

impl MemoryStore {
    /// Create a store bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, Entry>>, CoreError> {
        self.inner
            .lock()
            .map_err(|e| CoreError::Cache(anyhow::anyhow!("memory store mutex poisoned: {}", e)))
    }

    fn live_value(cache: &mut LruCache<String, Entry>, key: &str) -> Option<String> {
        match cache.get(key) {
            Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut cache = self.lock()?;
        Ok(Self::live_value(&mut cache, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError> {
        let mut cache = self.lock()?;
        cache.put(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut cache = self.lock()?;
        cache.pop(key);
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
        let mut cache = self.lock()?;
        let matching: Vec<String> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        let removed = matching.len() as u64;
        for key in matching {
            cache.pop(&key);
        }
        Ok(removed)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let mut cache = self.lock()?;
        let current = Self::live_value(&mut cache, key);
        if current.as_deref() != expected {
            return Ok(false);
        }
        cache.put(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoreError> {
        let mut cache = self.lock()?;
        match Self::live_value(&mut cache, key) {
            Some(current) if current == expected => {
                cache.pop(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, CoreError> {
        let mut cache = self.lock()?;
        match cache.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            _ => {
                cache.put(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn decrement(&self, key: &str) -> Result<i64, CoreError> {
        let mut cache = self.lock()?;
        match cache.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                let next = entry.value.parse::<i64>().unwrap_or(0) - 1;
                entry.value = next.to_string();
                Ok(next)
            }
            _ => Ok(0),
        }
    }
}
