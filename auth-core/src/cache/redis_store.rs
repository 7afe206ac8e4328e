//! Distributed backend for the cache substrate.
//!
//! Uses `ConnectionManager` for automatic reconnection. The conditional
//! primitives run as server-side scripts so they stay atomic across
//! instances.

use super::CacheStore;
use crate::error::CoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::sync::Arc;
use std::time::Duration;

const COMPARE_AND_SET: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  return 1
else
  return 0
end
"#;

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const INCREMENT_WITH_TTL: &str = r#"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
"#;

const DECREMENT_IF_PRESENT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return redis.call('DECR', KEYS[1])
else
  return 0
end
"#;

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    cas: Arc<Script>,
    cad: Arc<Script>,
    incr: Arc<Script>,
    decr: Arc<Script>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        tracing::info!(url = %url, "Connecting to shared cache store");
        let client = Client::open(url)?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to get cache connection manager");
            CoreError::Cache(anyhow::anyhow!("Failed to connect to shared store: {}", e))
        })?;

        tracing::info!("Connected to shared cache store");

        Ok(Self {
            manager,
            cas: Arc::new(Script::new(COMPARE_AND_SET)),
            cad: Arc::new(Script::new(COMPARE_AND_DELETE)),
            incr: Arc::new(Script::new(INCREMENT_WITH_TTL)),
            decr: Arc::new(Script::new(DECREMENT_IF_PRESENT)),
        })
    }

    pub async fn ping(&self) -> Result<(), CoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(CoreError::from)
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CoreError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_by_prefix(&self, prefix: &str) -> Result<u64, CoreError> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: u64 = redis::cmd("DEL").arg(&keys).query_async(&mut conn).await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
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
        let mut conn = self.manager.clone();

        match expected {
            // Absent-key case: a plain SET NX is already atomic.
            None => {
                let outcome: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(new)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await?;
                Ok(outcome.is_some())
            }
            Some(expected) => {
                let swapped: i64 = self
                    .cas
                    .key(key)
                    .arg(expected)
                    .arg(new)
                    .arg(ttl_millis(ttl))
                    .invoke_async(&mut conn)
                    .await?;
                Ok(swapped == 1)
            }
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, CoreError> {
        let mut conn = self.manager.clone();
        let deleted: i64 = self
            .cad
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn increment(&self, key: &str, ttl: Duration) -> Result<i64, CoreError> {
        let mut conn = self.manager.clone();
        let value: i64 = self
            .incr
            .key(key)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn decrement(&self, key: &str) -> Result<i64, CoreError> {
        let mut conn = self.manager.clone();
        let value: i64 = self.decr.key(key).invoke_async(&mut conn).await?;
        Ok(value)
    }
}
