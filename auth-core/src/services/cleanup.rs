//! Periodic removal of expired verification codes, stale auth attempts,
//! and expired trusted devices.
//!
//! Runs as an in-process task on a fixed interval, independent of request
//! traffic, with its own cancellation token. Each sweep appends a summary
//! security event so the sweeper leaves an auditable trail of its own
//! activity. Deletions are idempotent and safe to run concurrently.

use crate::config::CleanupConfig;
use crate::error::CoreError;
use crate::models::{SecurityEvent, SecurityEventType};
use crate::services::events::SecurityEventLog;
use crate::storage::AuthStorage;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub verification_codes_removed: u64,
    pub attempts_removed: u64,
    pub trusted_devices_removed: u64,
}

pub struct CleanupScheduler {
    storage: Arc<dyn AuthStorage>,
    events: SecurityEventLog,
    config: CleanupConfig,
}

impl CleanupScheduler {
    pub fn new(
        storage: Arc<dyn AuthStorage>,
        events: SecurityEventLog,
        config: CleanupConfig,
    ) -> Self {
        Self {
            storage,
            events,
            config,
        }
    }

    /// One sweep. Exposed directly so tests and operators can trigger it
    /// without the timer.
    pub async fn run_once(&self) -> Result<CleanupSummary, CoreError> {
        let code_cutoff = Utc::now() - ChronoDuration::seconds(self.config.code_grace_seconds);
        let attempt_cutoff = Utc::now() - ChronoDuration::days(self.config.attempt_retention_days);

        let summary = CleanupSummary {
            verification_codes_removed: self
                .storage
                .purge_expired_verification_codes(code_cutoff)
                .await?,
            attempts_removed: self.storage.purge_attempts_before(attempt_cutoff).await?,
            trusted_devices_removed: self.storage.purge_expired_trusted_devices().await?,
        };

        tracing::info!(
            verification_codes = summary.verification_codes_removed,
            attempts = summary.attempts_removed,
            trusted_devices = summary.trusted_devices_removed,
            "Cleanup sweep completed"
        );

        // Every sweep leaves its own audit record, counts included.
        self.events
            .record(SecurityEvent::system_action(
                SecurityEventType::CleanupCompleted,
                Some(serde_json::json!({
                    "verification_codes_removed": summary.verification_codes_removed,
                    "attempts_removed": summary.attempts_removed,
                    "trusted_devices_removed": summary.trusted_devices_removed,
                })),
            ))
            .await?;

        Ok(summary)
    }

    /// Start the periodic task. The returned handle cancels and joins it.
    pub fn spawn(self: Arc<Self>) -> CleanupHandle {
        let token = CancellationToken::new();
        let child = token.clone();
        let interval = Duration::from_secs(self.config.interval_seconds.max(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "Cleanup sweep failed");
                        }
                    }
                }
            }
        });

        CleanupHandle { token, task }
    }
}

pub struct CleanupHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl CleanupHandle {
    /// Request shutdown and wait for the task to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthAttempt, ClientContext, MfaMethod, TrustedDevice, VerificationCode};
    use crate::storage::MemoryStorage;
    use uuid::Uuid;

    fn scheduler(storage: Arc<MemoryStorage>) -> CleanupScheduler {
        CleanupScheduler::new(
            storage.clone(),
            SecurityEventLog::new(storage),
            CleanupConfig {
                interval_seconds: 60,
                attempt_retention_days: 30,
                code_grace_seconds: 3600,
            },
        )
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_rows() {
        let storage = Arc::new(MemoryStorage::new());
        let scheduler = scheduler(storage.clone());
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        // Fresh rows that must survive.
        storage
            .insert_verification_code(&VerificationCode::new(
                user,
                MfaMethod::Email,
                "hash".to_string(),
                600,
            ))
            .await
            .unwrap();
        storage
            .insert_attempt(&AuthAttempt::new(user, None, true, &ctx))
            .await
            .unwrap();

        // Rows past their windows.
        let mut stale_code =
            VerificationCode::new(user, MfaMethod::Email, "old".to_string(), 600);
        stale_code.expires_at = Utc::now() - ChronoDuration::hours(2);
        storage.insert_verification_code(&stale_code).await.unwrap();

        let mut stale_attempt = AuthAttempt::new(user, None, false, &ctx);
        stale_attempt.attempted_at = Utc::now() - ChronoDuration::days(31);
        storage.insert_attempt(&stale_attempt).await.unwrap();

        let mut stale_trust =
            TrustedDevice::new(user, "fp".to_string(), "token-hash".to_string(), 30);
        stale_trust.expires_at = Utc::now() - ChronoDuration::days(1);
        storage.upsert_trusted_device(&stale_trust).await.unwrap();

        let summary = scheduler.run_once().await.unwrap();
        assert_eq!(
            summary,
            CleanupSummary {
                verification_codes_removed: 1,
                attempts_removed: 1,
                trusted_devices_removed: 1,
            }
        );

        // The sweep leaves its own audit trail.
        let sweep_events: Vec<_> = storage
            .events_for_user(user, 10)
            .await
            .unwrap();
        assert!(sweep_events.is_empty(), "summary events are system-level");

        // Re-running is idempotent.
        let second = scheduler.run_once().await.unwrap();
        assert_eq!(second, CleanupSummary::default());
    }

    #[tokio::test]
    async fn spawned_task_stops_on_shutdown() {
        let storage = Arc::new(MemoryStorage::new());
        let scheduler = Arc::new(scheduler(storage));

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.shutdown().await;
    }
}
