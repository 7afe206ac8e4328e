//! Backup code lifecycle: batch generation and one-time redemption.
//!
//! Generation runs under the distributed lock so a regenerate can never
//! interleave with a concurrent redeem; redemption itself is a single
//! conditional transition in storage and needs no lock.

use crate::error::CoreError;
use crate::models::{
    AuthAttempt, BackupCode, ClientContext, SecurityEvent, SecurityEventType,
};
use crate::services::events::SecurityEventLog;
use crate::services::lock::DistributedLock;
use crate::services::rate_limit::{RateLimitStrategy, RateLimiter};
use crate::storage::AuthStorage;
use crate::utils::codes;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const BACKUP_CODE_BATCH: usize = 10;

const GENERATE_LOCK_TTL: Duration = Duration::from_secs(10);
const GENERATE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct BackupCodeManager {
    storage: Arc<dyn AuthStorage>,
    events: SecurityEventLog,
    lock: DistributedLock,
    rate_limiter: RateLimiter,
    redeem_limit: u32,
    redeem_window: Duration,
}

impl BackupCodeManager {
    pub fn new(
        storage: Arc<dyn AuthStorage>,
        events: SecurityEventLog,
        lock: DistributedLock,
        rate_limiter: RateLimiter,
        redeem_limit: u32,
        redeem_window: Duration,
    ) -> Self {
        Self {
            storage,
            events,
            lock,
            rate_limiter,
            redeem_limit,
            redeem_window,
        }
    }

    /// Generate a fresh batch, invalidating every previously active code.
    /// The plaintext codes are returned exactly once; the caller owns their
    /// one-time display.
    pub async fn generate(
        &self,
        user_id: Uuid,
        ctx: &ClientContext,
    ) -> Result<Vec<String>, CoreError> {
        let guard = self
            .lock
            .acquire(
                &format!("backup:{}", user_id),
                GENERATE_LOCK_TTL,
                GENERATE_LOCK_TIMEOUT,
            )
            .await?;

        let mut plaintexts = Vec::with_capacity(BACKUP_CODE_BATCH);
        let mut records = Vec::with_capacity(BACKUP_CODE_BATCH);
        for _ in 0..BACKUP_CODE_BATCH {
            let display = codes::generate_backup_code();
            let normalized: String = display.chars().filter(|c| *c != '-').collect();
            records.push(BackupCode::new(user_id, codes::hash_code(&normalized)));
            plaintexts.push(display);
        }

        let outcome = self.storage.replace_backup_codes(user_id, &records).await;
        guard.release().await?;
        outcome?;

        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::BackupCodesGenerated,
                Some(serde_json::json!({ "count": BACKUP_CODE_BATCH })),
                ctx,
            ))
            .await?;

        Ok(plaintexts)
    }

    /// Redeem a code. A used or unknown code returns `false` without
    /// revealing which; the `active -> used` transition happens at most once
    /// per code regardless of concurrency.
    pub async fn redeem(
        &self,
        user_id: Uuid,
        submitted: &str,
        ctx: &ClientContext,
    ) -> Result<bool, CoreError> {
        let decision = self
            .rate_limiter
            .check_escalating(
                &format!("mfa-verify:{}:backup", user_id),
                self.redeem_limit,
                self.redeem_window,
                RateLimitStrategy::SlidingWindow,
            )
            .await;
        if !decision.allowed {
            self.events.record_detached(SecurityEvent::user_action(
                user_id,
                SecurityEventType::RateLimitTripped,
                Some(serde_json::json!({ "scope": "backup_code" })),
                ctx,
            ));
            return Err(CoreError::RateLimitExceeded {
                retry_after: decision.retry_after.unwrap_or(self.redeem_window),
            });
        }

        let redeemed = match codes::normalize_backup_code(submitted) {
            Some(normalized) => {
                self.storage
                    .redeem_backup_code(user_id, &codes::hash_code(&normalized))
                    .await?
            }
            // Malformed input gets the same answer as a wrong code.
            None => false,
        };

        self.events
            .record_attempt(AuthAttempt::new(user_id, None, redeemed, ctx))
            .await?;

        if redeemed {
            // A successful redemption clears the failure budget.
            self.rate_limiter
                .reset(&format!("mfa-verify:{}:backup", user_id))
                .await?;
            self.events
                .record(SecurityEvent::user_action(
                    user_id,
                    SecurityEventType::BackupCodeRedeemed,
                    None,
                    ctx,
                ))
                .await?;
        }

        Ok(redeemed)
    }

    pub async fn remaining(&self, user_id: Uuid) -> Result<i64, CoreError> {
        self.storage.active_backup_code_count(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryStore};
    use crate::storage::MemoryStorage;

    fn manager() -> BackupCodeManager {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(256));
        let storage: Arc<dyn AuthStorage> = Arc::new(MemoryStorage::new());
        BackupCodeManager::new(
            storage.clone(),
            SecurityEventLog::new(storage),
            DistributedLock::new(cache.clone()),
            RateLimiter::new(cache),
            5,
            Duration::from_secs(300),
        )
    }

    #[tokio::test]
    async fn generates_a_batch_of_ten() {
        let manager = manager();
        let user = Uuid::new_v4();

        let plaintexts = manager.generate(user, &ClientContext::default()).await.unwrap();
        assert_eq!(plaintexts.len(), BACKUP_CODE_BATCH);
        assert_eq!(manager.remaining(user).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn redeem_succeeds_once_per_code() {
        let manager = manager();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let plaintexts = manager.generate(user, &ctx).await.unwrap();
        let code = &plaintexts[0];

        assert!(manager.redeem(user, code, &ctx).await.unwrap());
        assert!(!manager.redeem(user, code, &ctx).await.unwrap());
        assert_eq!(manager.remaining(user).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn regeneration_invalidates_previous_batch() {
        let manager = manager();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let old = manager.generate(user, &ctx).await.unwrap();
        let new = manager.generate(user, &ctx).await.unwrap();

        assert!(!manager.redeem(user, &old[0], &ctx).await.unwrap());
        assert!(manager.redeem(user, &new[0], &ctx).await.unwrap());
        assert_eq!(manager.remaining(user).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn concurrent_redemptions_of_one_code_have_one_winner() {
        let manager = Arc::new(manager());
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let plaintexts = manager.generate(user, &ctx).await.unwrap();
        let code = plaintexts[0].clone();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let manager = manager.clone();
            let code = code.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                manager.redeem(user, &code, &ctx).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn unknown_and_malformed_codes_read_the_same() {
        let manager = manager();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();
        manager.generate(user, &ctx).await.unwrap();

        assert!(!manager.redeem(user, "ZZZZ-ZZZZ-ZZ", &ctx).await.unwrap());
        assert!(!manager.redeem(user, "not a code", &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn redemption_attempts_are_rate_limited() {
        let manager = manager();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();
        manager.generate(user, &ctx).await.unwrap();

        for _ in 0..5 {
            let _ = manager.redeem(user, "ZZZZ-ZZZZ-ZZ", &ctx).await.unwrap();
        }
        let denied = manager.redeem(user, "ZZZZ-ZZZZ-ZZ", &ctx).await;
        assert!(matches!(denied, Err(CoreError::RateLimitExceeded { .. })));
    }
}
