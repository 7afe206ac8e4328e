//! Cache substrate: a hybrid key/value store shared by every component.
//!
//! Higher components depend on [`CacheStore`] only, so whether the backing
//! store is the distributed one or the in-process fallback is invisible to
//! them. Values are self-describing JSON strings, which keeps the two
//! backends interchangeable.

mod hybrid;
mod memory;
mod redis_store;

pub use hybrid::{CacheMode, HybridCache};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::error::CoreError;
use async_trait::async_trait;
use std::time::Duration;

/// The atomic key/value contract every backend must satisfy.
///
/// `compare_and_set` and `compare_and_delete` are the primitives locks and
/// single-use code consumption are built on; plain read-modify-write
/// sequences on shared keys are forbidden everywhere in this crate.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError>;

    async fn delete(&self, key: &str) -> Result<(), CoreError>;

    /// Delete every key starting with `prefix`. Returns the number removed.
    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CoreError>;

    /// Write `new` only if the current value equals `expected`
    /// (`None` = key must be absent). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Delete the key only if its current value equals `expected`. Returns
    /// whether the delete happened.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoreError>;

    /// Atomically increment a counter, creating it with `ttl` on first use.
    /// Returns the post-increment value.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, CoreError>;

    /// Atomically decrement an existing counter; absent keys stay absent and
    /// yield 0. Used to refund denied rate-limit increments.
    async fn decrement(&self, key: &str) -> Result<i64, CoreError>;
}
