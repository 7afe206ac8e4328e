//! Verification code issuance and single-use validation for sms/email
//! factors.
//!
//! Only the code hash ever reaches storage; the plaintext goes to the
//! delivery collaborator and is gone. The authoritative copy lives in the
//! cache slot `mfa:verify:{user}:{method}`. Issuing overwrites the slot,
//! which is what makes a newer code invalidate every older one, and
//! consumption is a compare-and-delete so a code validates at most once
//! even under concurrent submissions.

use crate::cache::CacheStore;
use crate::error::CoreError;
use crate::models::{ClientContext, MfaMethod, SecurityEvent, SecurityEventType, VerificationCode};
use crate::services::events::SecurityEventLog;
use crate::services::rate_limit::{RateLimitStrategy, RateLimiter};
use crate::storage::AuthStorage;
use crate::utils::codes;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Delivery collaborator. Transports (SMS gateway, mailer) live outside
/// this core; the reference implementation only logs that a dispatch
/// happened, never the code itself.
#[async_trait]
pub trait CodeSender: Send + Sync {
    async fn send(
        &self,
        user_id: Uuid,
        method: MfaMethod,
        destination: Option<&str>,
        code: &str,
    ) -> Result<(), CoreError>;
}

pub struct LoggingCodeSender;

#[async_trait]
impl CodeSender for LoggingCodeSender {
    async fn send(
        &self,
        user_id: Uuid,
        method: MfaMethod,
        _destination: Option<&str>,
        _code: &str,
    ) -> Result<(), CoreError> {
        tracing::info!(%user_id, method = method.as_str(), "Verification code dispatched");
        Ok(())
    }
}

/// Opaque issuance handle returned to callers.
#[derive(Debug, Clone)]
pub struct CodeIssue {
    pub code_id: Uuid,
    pub expires_in: Duration,
}

/// Cache-slot payload for the currently valid code of a `(user, method)`.
#[derive(Debug, Serialize, Deserialize)]
struct CodeSlot {
    code_id: Uuid,
    code_hash: String,
}

#[derive(Clone)]
pub struct VerificationCodeService {
    cache: Arc<dyn CacheStore>,
    storage: Arc<dyn AuthStorage>,
    events: SecurityEventLog,
    rate_limiter: RateLimiter,
    sender: Arc<dyn CodeSender>,
    code_ttl: Duration,
    code_length: usize,
    issue_limit: u32,
    issue_window: Duration,
    verify_limit: u32,
    verify_window: Duration,
}

impl VerificationCodeService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        storage: Arc<dyn AuthStorage>,
        events: SecurityEventLog,
        rate_limiter: RateLimiter,
        sender: Arc<dyn CodeSender>,
        code_ttl: Duration,
        code_length: usize,
        issue_limit: u32,
        issue_window: Duration,
        verify_limit: u32,
        verify_window: Duration,
    ) -> Self {
        Self {
            cache,
            storage,
            events,
            rate_limiter,
            sender,
            code_ttl,
            code_length,
            issue_limit,
            issue_window,
            verify_limit,
            verify_window,
        }
    }

    fn slot_key(user_id: Uuid, method: MfaMethod) -> String {
        format!("mfa:verify:{}:{}", user_id, method.as_str())
    }

    /// Key shared with the MFA manager so each `(user, kind)` has a single
    /// verification budget.
    pub(crate) fn verify_limit_key(user_id: Uuid, method: MfaMethod) -> String {
        format!("mfa-verify:{}:{}", user_id, method.as_str())
    }

    /// Issue a fresh code for `(user, method)`, invalidating any prior
    /// unused one for that pair.
    pub async fn issue(
        &self,
        user_id: Uuid,
        method: MfaMethod,
        destination: Option<&str>,
        ctx: &ClientContext,
    ) -> Result<CodeIssue, CoreError> {
        if method == MfaMethod::Totp {
            return Err(CoreError::Validation(
                "TOTP factors do not use delivered codes".to_string(),
            ));
        }

        self.rate_limiter
            .enforce(
                &format!("mfa-issue:{}:{}", user_id, method.as_str()),
                self.issue_limit,
                self.issue_window,
                RateLimitStrategy::FixedWindow,
            )
            .await?;

        self.storage
            .supersede_verification_codes(user_id, method)
            .await?;

        let code = codes::generate_numeric_code(self.code_length);
        let record = VerificationCode::new(
            user_id,
            method,
            codes::hash_code(&code),
            self.code_ttl.as_secs() as i64,
        );

        let slot = serde_json::to_string(&CodeSlot {
            code_id: record.code_id,
            code_hash: record.code_hash.clone(),
        })
        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;

        // Overwriting the slot is the invalidation of the previous code.
        self.cache
            .set(&Self::slot_key(user_id, method), &slot, self.code_ttl)
            .await?;
        self.storage.insert_verification_code(&record).await?;

        self.sender.send(user_id, method, destination, &code).await?;

        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::VerificationCodeIssued,
                Some(serde_json::json!({ "method": method.as_str() })),
                ctx,
            ))
            .await?;

        Ok(CodeIssue {
            code_id: record.code_id,
            expires_in: self.code_ttl,
        })
    }

    /// Validate a submitted code. Unknown, expired, superseded, and wrong
    /// codes are all reported identically as `false`.
    pub async fn validate(
        &self,
        user_id: Uuid,
        method: MfaMethod,
        submitted: &str,
        ctx: &ClientContext,
    ) -> Result<bool, CoreError> {
        let decision = self
            .rate_limiter
            .check_escalating(
                &Self::verify_limit_key(user_id, method),
                self.verify_limit,
                self.verify_window,
                RateLimitStrategy::SlidingWindow,
            )
            .await;
        if !decision.allowed {
            self.events.record_detached(SecurityEvent::user_action(
                user_id,
                SecurityEventType::RateLimitTripped,
                Some(serde_json::json!({ "scope": "verification_code" })),
                ctx,
            ));
            return Err(CoreError::RateLimitExceeded {
                retry_after: decision.retry_after.unwrap_or(self.verify_window),
            });
        }

        let key = Self::slot_key(user_id, method);
        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(false);
        };

        let slot: CodeSlot = match serde_json::from_str(&raw) {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable code slot");
                self.cache.delete(&key).await?;
                return Ok(false);
            }
        };

        if !codes::constant_time_eq(&codes::hash_code(submitted), &slot.code_hash) {
            return Ok(false);
        }

        // The compare-and-delete IS the consumption: exactly one of any
        // number of concurrent matching submissions wins.
        if !self.cache.compare_and_delete(&key, &raw).await? {
            return Ok(false);
        }

        self.storage
            .mark_verification_code_used(slot.code_id)
            .await?;
        // A successful verification clears the failure budget.
        self.rate_limiter
            .reset(&Self::verify_limit_key(user_id, method))
            .await?;
        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::VerificationCodeConsumed,
                Some(serde_json::json!({ "method": method.as_str() })),
                ctx,
            ))
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::storage::MemoryStorage;
    use std::sync::Mutex;

    struct CapturingSender {
        last_code: Mutex<Option<String>>,
    }

    #[async_trait]
    impl CodeSender for CapturingSender {
        async fn send(
            &self,
            _user_id: Uuid,
            _method: MfaMethod,
            _destination: Option<&str>,
            code: &str,
        ) -> Result<(), CoreError> {
            *self.last_code.lock().unwrap() = Some(code.to_string());
            Ok(())
        }
    }

    fn service() -> (VerificationCodeService, Arc<CapturingSender>) {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(256));
        let storage: Arc<dyn AuthStorage> = Arc::new(MemoryStorage::new());
        let sender = Arc::new(CapturingSender {
            last_code: Mutex::new(None),
        });
        let service = VerificationCodeService::new(
            cache.clone(),
            storage.clone(),
            SecurityEventLog::new(storage.clone()),
            RateLimiter::new(cache),
            sender.clone(),
            Duration::from_secs(600),
            6,
            10,
            Duration::from_secs(900),
            5,
            Duration::from_secs(300),
        );
        (service, sender)
    }

    fn sent_code(sender: &CapturingSender) -> String {
        sender.last_code.lock().unwrap().clone().expect("a code was sent")
    }

    #[tokio::test]
    async fn code_validates_exactly_once() {
        let (service, sender) = service();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        service
            .issue(user, MfaMethod::Email, Some("u@example.com"), &ctx)
            .await
            .unwrap();
        let code = sent_code(&sender);

        assert!(service
            .validate(user, MfaMethod::Email, &code, &ctx)
            .await
            .unwrap());
        assert!(!service
            .validate(user, MfaMethod::Email, &code, &ctx)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn issuing_supersedes_the_previous_code() {
        let (service, sender) = service();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        service.issue(user, MfaMethod::Sms, Some("+15550100"), &ctx).await.unwrap();
        let old_code = sent_code(&sender);

        service.issue(user, MfaMethod::Sms, Some("+15550100"), &ctx).await.unwrap();
        let new_code = sent_code(&sender);

        assert!(!service
            .validate(user, MfaMethod::Sms, &old_code, &ctx)
            .await
            .unwrap());
        assert!(service
            .validate(user, MfaMethod::Sms, &new_code, &ctx)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn wrong_code_and_missing_code_are_indistinguishable() {
        let (service, _) = service();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        // Nothing issued yet.
        assert!(!service
            .validate(user, MfaMethod::Email, "123456", &ctx)
            .await
            .unwrap());

        service.issue(user, MfaMethod::Email, None, &ctx).await.unwrap();
        assert!(!service
            .validate(user, MfaMethod::Email, "000000", &ctx)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_submissions_yield_one_winner() {
        let (service, sender) = service();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        service.issue(user, MfaMethod::Email, None, &ctx).await.unwrap();
        let code = sent_code(&sender);

        let service = Arc::new(service);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let service = service.clone();
            let code = code.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                service
                    .validate(user, MfaMethod::Email, &code, &ctx)
                    .await
                    .unwrap()
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
    async fn validation_attempts_are_rate_limited() {
        let (service, _) = service();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        service.issue(user, MfaMethod::Email, None, &ctx).await.unwrap();

        for _ in 0..5 {
            assert!(!service
                .validate(user, MfaMethod::Email, "999999", &ctx)
                .await
                .unwrap());
        }
        let denied = service.validate(user, MfaMethod::Email, "999999", &ctx).await;
        assert!(matches!(
            denied,
            Err(CoreError::RateLimitExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn totp_method_cannot_be_issued_codes() {
        let (service, _) = service();
        let outcome = service
            .issue(Uuid::new_v4(), MfaMethod::Totp, None, &ClientContext::default())
            .await;
        assert!(matches!(outcome, Err(CoreError::Validation(_))));
    }
}
