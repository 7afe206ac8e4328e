//! MFA device lifecycle: enroll, confirm, verify, disable.
//!
//! Devices move `pending -> active -> disabled` and nothing else; disabled
//! is terminal and a replacement device must be enrolled to restore the
//! method. Every verification call, success or failure, is gated by the
//! rate limiter and recorded as an auth attempt.

use crate::error::CoreError;
use crate::models::{
    AuthAttempt, ClientContext, MfaDevice, MfaDeviceMetadata, MfaMethod, SecurityEvent,
    SecurityEventType, UserMfa,
};
use crate::services::events::SecurityEventLog;
use crate::services::rate_limit::{RateLimitStrategy, RateLimiter};
use crate::services::totp::{TotpProvisioning, TotpService};
use crate::services::verification::{CodeIssue, VerificationCodeService};
use crate::storage::AuthStorage;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Caller-supplied enrollment details.
#[derive(Debug, Clone, Default)]
pub struct EnrollmentRequest {
    pub display_name: String,
    /// Account label stamped into the TOTP provisioning URI.
    pub account_label: Option<String>,
    /// Destination for `sms` enrollment.
    pub phone_number: Option<String>,
    /// Destination for `email` enrollment.
    pub email: Option<String>,
}

/// Result of starting an enrollment. TOTP enrollments carry provisioning
/// material; sms/email enrollments carry the delivery handle of the code
/// that was just sent.
#[derive(Debug, Clone)]
pub struct Enrollment {
    pub device_id: Uuid,
    pub totp: Option<TotpProvisioning>,
    pub delivery: Option<CodeIssue>,
}

#[derive(Clone)]
pub struct MfaDeviceManager {
    storage: Arc<dyn AuthStorage>,
    events: SecurityEventLog,
    rate_limiter: RateLimiter,
    totp: TotpService,
    verification: VerificationCodeService,
    verify_limit: u32,
    verify_window: Duration,
}

impl MfaDeviceManager {
    pub fn new(
        storage: Arc<dyn AuthStorage>,
        events: SecurityEventLog,
        rate_limiter: RateLimiter,
        totp: TotpService,
        verification: VerificationCodeService,
        verify_limit: u32,
        verify_window: Duration,
    ) -> Self {
        Self {
            storage,
            events,
            rate_limiter,
            totp,
            verification,
            verify_limit,
            verify_window,
        }
    }

    /// Whether a second factor is required for this user, and which kinds
    /// are available.
    pub async fn require_mfa(&self, user_id: Uuid) -> Result<Option<Vec<MfaMethod>>, CoreError> {
        let mfa = self.storage.user_mfa(user_id).await?;
        Ok(mfa.mfa_enabled.then_some(mfa.mfa_methods))
    }

    /// Enrolled devices, disabled ones filtered out.
    pub async fn list_devices(&self, user_id: Uuid) -> Result<Vec<MfaDevice>, CoreError> {
        let devices = self.storage.devices_for_user(user_id).await?;
        Ok(devices.into_iter().filter(|d| !matches!(d.status(), Some(crate::models::DeviceStatus::Disabled))).collect())
    }

    /// Start enrolling a device of `kind`. Rejects with `DeviceConflict`
    /// while an active device of that kind exists; the old one must be
    /// disabled first, never silently replaced.
    pub async fn enroll(
        &self,
        user_id: Uuid,
        kind: MfaMethod,
        request: EnrollmentRequest,
        ctx: &ClientContext,
    ) -> Result<Enrollment, CoreError> {
        if self.storage.active_device(user_id, kind).await?.is_some() {
            return Err(CoreError::DeviceConflict);
        }

        let metadata = MfaDeviceMetadata {
            enrolled_ip: ctx.ip_address.clone(),
            enrolled_user_agent: ctx.user_agent.clone(),
        };

        let mut device = MfaDevice::new(
            user_id,
            kind,
            request.display_name.clone(),
            None,
            request.phone_number.clone(),
            metadata,
        );

        let mut totp_provisioning = None;
        match kind {
            MfaMethod::Totp => {
                let account = request
                    .account_label
                    .as_deref()
                    .unwrap_or("account")
                    .to_string();
                let (provisioning, secret_enc) =
                    self.totp
                        .begin_enrollment(user_id, device.device_id, &account)?;
                device.secret_enc = Some(secret_enc);
                totp_provisioning = Some(provisioning);
            }
            MfaMethod::Sms => {
                if request.phone_number.is_none() {
                    return Err(CoreError::Validation(
                        "sms enrollment requires a phone number".to_string(),
                    ));
                }
            }
            MfaMethod::Email => {}
        }

        self.storage.insert_device(&device).await?;
        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::DeviceEnrollmentStarted,
                Some(serde_json::json!({ "kind": kind.as_str() })),
                ctx,
            ))
            .await?;

        // Delivered factors get their first code immediately.
        let delivery = match kind {
            MfaMethod::Sms => Some(
                self.verification
                    .issue(user_id, kind, request.phone_number.as_deref(), ctx)
                    .await?,
            ),
            MfaMethod::Email => Some(
                self.verification
                    .issue(user_id, kind, request.email.as_deref(), ctx)
                    .await?,
            ),
            MfaMethod::Totp => None,
        };

        Ok(Enrollment {
            device_id: device.device_id,
            totp: totp_provisioning,
            delivery,
        })
    }

    /// Validate the enrollment proof and activate the device. On success
    /// the user's `mfa_enabled` flag and method set are updated; on failure
    /// the device stays pending and the attempt is recorded.
    pub async fn confirm_enrollment(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        proof: &str,
        ctx: &ClientContext,
    ) -> Result<bool, CoreError> {
        let device = self
            .storage
            .device_by_id(user_id, device_id)
            .await?
            .ok_or(CoreError::DeviceNotFound)?;

        if device.is_active() {
            return Ok(true);
        }
        if !device.is_pending() {
            return Err(CoreError::DeviceNotFound);
        }
        let kind = device
            .kind()
            .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("unknown device kind")))?;

        let valid = self.validate_proof(&device, kind, proof, ctx).await?;
        self.events
            .record_attempt(AuthAttempt::new(user_id, Some(kind), valid, ctx))
            .await?;

        if !valid {
            return Ok(false);
        }

        // Someone may have activated another device of this kind while the
        // proof was in flight; the one-active-per-kind invariant wins.
        if self.storage.active_device(user_id, kind).await?.is_some() {
            return Err(CoreError::DeviceConflict);
        }

        self.storage.mark_device_active(device_id).await?;

        let mut mfa = self.storage.user_mfa(user_id).await?;
        mfa.add_method(kind);
        self.storage.set_user_mfa(user_id, &mfa).await?;

        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::DeviceActivated,
                Some(serde_json::json!({ "kind": kind.as_str() })),
                ctx,
            ))
            .await?;

        Ok(true)
    }

    /// Login-time verification against the active device of `kind`. Every
    /// call is rate-limited per `(user, kind)` and recorded as an attempt;
    /// a missing device reads the same as a wrong proof.
    pub async fn verify(
        &self,
        user_id: Uuid,
        kind: MfaMethod,
        proof: &str,
        ctx: &ClientContext,
    ) -> Result<bool, CoreError> {
        let device = self.storage.active_device(user_id, kind).await?;
        let valid = match &device {
            None => {
                // Absent devices still burn budget, so they are not
                // probeable for free.
                self.enforce_verify_budget(user_id, kind, ctx).await?;
                false
            }
            Some(device) => self.validate_proof(device, kind, proof, ctx).await?,
        };

        self.events
            .record_attempt(AuthAttempt::new(user_id, Some(kind), valid, ctx))
            .await?;

        if valid {
            if let Some(device) = &device {
                self.storage.touch_device_used(device.device_id).await?;
            }
            self.events
                .record(SecurityEvent::user_action(
                    user_id,
                    SecurityEventType::MfaVerifySucceeded,
                    Some(serde_json::json!({ "kind": kind.as_str() })),
                    ctx,
                ))
                .await?;
        } else {
            self.events
                .record(SecurityEvent::user_action(
                    user_id,
                    SecurityEventType::MfaVerifyFailed,
                    Some(serde_json::json!({ "kind": kind.as_str() })),
                    ctx,
                ))
                .await?;
        }

        Ok(valid)
    }

    /// Disable a device. When no active device remains for the user, the
    /// user's `mfa_enabled` flag is cleared.
    pub async fn disable(
        &self,
        user_id: Uuid,
        device_id: Uuid,
        ctx: &ClientContext,
    ) -> Result<(), CoreError> {
        let device = self
            .storage
            .device_by_id(user_id, device_id)
            .await?
            .ok_or(CoreError::DeviceNotFound)?;

        if matches!(device.status(), Some(crate::models::DeviceStatus::Disabled)) {
            return Ok(());
        }

        self.storage.mark_device_disabled(device_id).await?;

        // Recompute the method set from what is still active.
        let devices = self.storage.devices_for_user(user_id).await?;
        let methods: Vec<MfaMethod> = [MfaMethod::Totp, MfaMethod::Sms, MfaMethod::Email]
            .into_iter()
            .filter(|kind| {
                devices
                    .iter()
                    .any(|d| d.kind_code == kind.as_str() && d.is_active())
            })
            .collect();
        let mfa = UserMfa {
            mfa_enabled: !methods.is_empty(),
            mfa_methods: methods,
        };
        self.storage.set_user_mfa(user_id, &mfa).await?;

        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::DeviceDisabled,
                Some(serde_json::json!({ "device_id": device_id })),
                ctx,
            ))
            .await?;

        Ok(())
    }

    async fn enforce_verify_budget(
        &self,
        user_id: Uuid,
        kind: MfaMethod,
        ctx: &ClientContext,
    ) -> Result<(), CoreError> {
        let decision = self
            .rate_limiter
            .check_escalating(
                &VerificationCodeService::verify_limit_key(user_id, kind),
                self.verify_limit,
                self.verify_window,
                RateLimitStrategy::SlidingWindow,
            )
            .await;
        if decision.allowed {
            return Ok(());
        }

        self.events.record_detached(SecurityEvent::user_action(
            user_id,
            SecurityEventType::RateLimitTripped,
            Some(serde_json::json!({ "scope": "mfa_verify", "kind": kind.as_str() })),
            ctx,
        ));
        Err(CoreError::RateLimitExceeded {
            retry_after: decision.retry_after.unwrap_or(self.verify_window),
        })
    }

    async fn validate_proof(
        &self,
        device: &MfaDevice,
        kind: MfaMethod,
        proof: &str,
        ctx: &ClientContext,
    ) -> Result<bool, CoreError> {
        match kind {
            MfaMethod::Totp => {
                // The budget check precedes the code check, so exhausting
                // the window denies even a correct code.
                self.enforce_verify_budget(device.user_id, kind, ctx).await?;
                let secret_enc = device.secret_enc.as_deref().ok_or_else(|| {
                    CoreError::Internal(anyhow::anyhow!("totp device without secret"))
                })?;
                let valid =
                    self.totp
                        .verify(secret_enc, device.user_id, device.device_id, proof)?;
                if valid {
                    self.rate_limiter
                        .reset(&VerificationCodeService::verify_limit_key(
                            device.user_id,
                            kind,
                        ))
                        .await?;
                }
                Ok(valid)
            }
            MfaMethod::Sms | MfaMethod::Email => {
                self.verification
                    .validate(device.user_id, kind, proof, ctx)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, MemoryStore};
    use crate::services::verification::CodeSender;
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use totp_rs::{Algorithm, Secret, TOTP};

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

    struct Fixture {
        manager: MfaDeviceManager,
        storage: Arc<MemoryStorage>,
        sender: Arc<CapturingSender>,
    }

    fn fixture() -> Fixture {
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(512));
        let storage = Arc::new(MemoryStorage::new());
        let events = SecurityEventLog::new(storage.clone());
        let rate_limiter = RateLimiter::new(cache.clone());
        let sender = Arc::new(CapturingSender {
            last_code: Mutex::new(None),
        });
        let verification = VerificationCodeService::new(
            cache,
            storage.clone(),
            events.clone(),
            rate_limiter.clone(),
            sender.clone(),
            Duration::from_secs(600),
            6,
            10,
            Duration::from_secs(900),
            5,
            Duration::from_secs(300),
        );
        let manager = MfaDeviceManager::new(
            storage.clone(),
            events,
            rate_limiter,
            TotpService::new("auth-core-test".to_string(), [9u8; 32]),
            verification,
            5,
            Duration::from_secs(300),
        );
        Fixture {
            manager,
            storage,
            sender,
        }
    }

    fn totp_code(secret_base32: &str) -> String {
        let bytes = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
        let totp = TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            bytes,
            Some("auth-core-test".to_string()),
            "account".to_string(),
        )
        .unwrap();
        totp.generate_current().unwrap()
    }

    fn totp_request() -> EnrollmentRequest {
        EnrollmentRequest {
            display_name: "Authenticator".to_string(),
            account_label: Some("user@example.com".to_string()),
            ..EnrollmentRequest::default()
        }
    }

    #[tokio::test]
    async fn totp_enrollment_activates_device_and_user_flags() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let enrollment = fx
            .manager
            .enroll(user, MfaMethod::Totp, totp_request(), &ctx)
            .await
            .unwrap();
        let provisioning = enrollment.totp.unwrap();

        assert!(fx.manager.require_mfa(user).await.unwrap().is_none());

        let code = totp_code(&provisioning.secret_base32);
        assert!(fx
            .manager
            .confirm_enrollment(user, enrollment.device_id, &code, &ctx)
            .await
            .unwrap());

        let methods = fx.manager.require_mfa(user).await.unwrap().unwrap();
        assert_eq!(methods, vec![MfaMethod::Totp]);

        let device = fx
            .storage
            .device_by_id(user, enrollment.device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(device.is_active());
        assert!(device.verified_at.is_some());
    }

    #[tokio::test]
    async fn wrong_confirmation_code_leaves_device_pending() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let enrollment = fx
            .manager
            .enroll(user, MfaMethod::Totp, totp_request(), &ctx)
            .await
            .unwrap();

        assert!(!fx
            .manager
            .confirm_enrollment(user, enrollment.device_id, "000000", &ctx)
            .await
            .unwrap());

        let device = fx
            .storage
            .device_by_id(user, enrollment.device_id)
            .await
            .unwrap()
            .unwrap();
        assert!(device.is_pending());

        // The failure is on the attempt record.
        let attempts = fx
            .storage
            .attempts_for_user(user, chrono::Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(attempts.len(), 1);
        assert!(!attempts[0].success);
        assert_eq!(attempts[0].method_code.as_deref(), Some("totp"));
    }

    #[tokio::test]
    async fn duplicate_active_enrollment_conflicts_until_disabled() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let enrollment = fx
            .manager
            .enroll(user, MfaMethod::Totp, totp_request(), &ctx)
            .await
            .unwrap();
        let code = totp_code(&enrollment.totp.as_ref().unwrap().secret_base32);
        fx.manager
            .confirm_enrollment(user, enrollment.device_id, &code, &ctx)
            .await
            .unwrap();

        let conflict = fx
            .manager
            .enroll(user, MfaMethod::Totp, totp_request(), &ctx)
            .await;
        assert!(matches!(conflict, Err(CoreError::DeviceConflict)));

        fx.manager
            .disable(user, enrollment.device_id, &ctx)
            .await
            .unwrap();
        assert!(fx.manager.require_mfa(user).await.unwrap().is_none());

        // A fresh enrollment of the same kind now succeeds.
        fx.manager
            .enroll(user, MfaMethod::Totp, totp_request(), &ctx)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn verify_checks_the_active_device() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let enrollment = fx
            .manager
            .enroll(user, MfaMethod::Totp, totp_request(), &ctx)
            .await
            .unwrap();
        let secret = enrollment.totp.as_ref().unwrap().secret_base32.clone();
        fx.manager
            .confirm_enrollment(user, enrollment.device_id, &totp_code(&secret), &ctx)
            .await
            .unwrap();

        assert!(fx
            .manager
            .verify(user, MfaMethod::Totp, &totp_code(&secret), &ctx)
            .await
            .unwrap());
        assert!(!fx
            .manager
            .verify(user, MfaMethod::Totp, "000000", &ctx)
            .await
            .unwrap());
        // No sms device enrolled: same denial as a wrong code.
        assert!(!fx
            .manager
            .verify(user, MfaMethod::Sms, "123456", &ctx)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn six_failures_in_window_trip_the_limiter_regardless_of_correctness() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let enrollment = fx
            .manager
            .enroll(user, MfaMethod::Totp, totp_request(), &ctx)
            .await
            .unwrap();
        let secret = enrollment.totp.as_ref().unwrap().secret_base32.clone();
        fx.manager
            .confirm_enrollment(user, enrollment.device_id, &totp_code(&secret), &ctx)
            .await
            .unwrap();

        // Confirmation succeeded, so the budget starts full; five failures
        // exhaust it.
        for _ in 0..5 {
            assert!(!fx
                .manager
                .verify(user, MfaMethod::Totp, "000000", &ctx)
                .await
                .unwrap());
        }

        let denied = fx
            .manager
            .verify(user, MfaMethod::Totp, &totp_code(&secret), &ctx)
            .await;
        assert!(matches!(denied, Err(CoreError::RateLimitExceeded { .. })));
    }

    #[tokio::test]
    async fn email_enrollment_confirms_with_delivered_code() {
        let fx = fixture();
        let user = Uuid::new_v4();
        let ctx = ClientContext::default();

        let enrollment = fx
            .manager
            .enroll(
                user,
                MfaMethod::Email,
                EnrollmentRequest {
                    display_name: "Work inbox".to_string(),
                    email: Some("user@example.com".to_string()),
                    ..EnrollmentRequest::default()
                },
                &ctx,
            )
            .await
            .unwrap();
        assert!(enrollment.delivery.is_some());

        let code = fx.sender.last_code.lock().unwrap().clone().unwrap();
        assert!(fx
            .manager
            .confirm_enrollment(user, enrollment.device_id, &code, &ctx)
            .await
            .unwrap());

        let methods = fx.manager.require_mfa(user).await.unwrap().unwrap();
        assert_eq!(methods, vec![MfaMethod::Email]);
    }

    #[tokio::test]
    async fn sms_enrollment_requires_a_phone_number() {
        let fx = fixture();
        let outcome = fx
            .manager
            .enroll(
                Uuid::new_v4(),
                MfaMethod::Sms,
                EnrollmentRequest {
                    display_name: "Phone".to_string(),
                    ..EnrollmentRequest::default()
                },
                &ClientContext::default(),
            )
            .await;
        assert!(matches!(outcome, Err(CoreError::Validation(_))));
    }

    #[tokio::test]
    async fn confirm_unknown_device_is_not_found() {
        let fx = fixture();
        let outcome = fx
            .manager
            .confirm_enrollment(
                Uuid::new_v4(),
                Uuid::new_v4(),
                "000000",
                &ClientContext::default(),
            )
            .await;
        assert!(matches!(outcome, Err(CoreError::DeviceNotFound)));
    }
}
