//! Trusted device trust tokens: issue, validate, revoke.
//!
//! A validated trust token lets the login flow skip the MFA verify step.
//! Validation requires the token hash, the fingerprint, and non-expiry to
//! all match; any failure, including storage trouble, reads as "not
//! trusted" so the login falls back to full MFA instead of failing.

use crate::error::CoreError;
use crate::models::{ClientContext, SecurityEvent, SecurityEventType, TrustedDevice};
use crate::services::events::SecurityEventLog;
use crate::storage::AuthStorage;
use crate::utils::codes;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct TrustedDeviceManager {
    storage: Arc<dyn AuthStorage>,
    events: SecurityEventLog,
    trust_ttl_days: i64,
    sliding: bool,
}

impl TrustedDeviceManager {
    pub fn new(
        storage: Arc<dyn AuthStorage>,
        events: SecurityEventLog,
        trust_ttl_days: i64,
        sliding: bool,
    ) -> Self {
        Self {
            storage,
            events,
            trust_ttl_days,
            sliding,
        }
    }

    /// Grant trust to `(user, fingerprint)`, replacing any previous grant
    /// for the pair. Returns the plaintext token exactly once.
    pub async fn issue_trust(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        ctx: &ClientContext,
    ) -> Result<String, CoreError> {
        if fingerprint.is_empty() {
            return Err(CoreError::Validation(
                "device fingerprint must not be empty".to_string(),
            ));
        }

        let token = codes::generate_token(32);
        let mut device = TrustedDevice::new(
            user_id,
            fingerprint.to_string(),
            codes::hash_code(&token),
            self.trust_ttl_days,
        );
        device.last_ip_address = ctx.ip_address.clone();
        device.last_user_agent = ctx.user_agent.clone();

        self.storage.upsert_trusted_device(&device).await?;
        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::TrustGranted,
                Some(serde_json::json!({ "fingerprint": fingerprint })),
                ctx,
            ))
            .await?;

        Ok(token)
    }

    /// Whether the presented token currently grants an MFA skip. Updates
    /// usage bookkeeping and, when sliding trust is on, pushes the expiry
    /// out on each successful validation.
    pub async fn validate_trust(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        token: &str,
        ctx: &ClientContext,
    ) -> bool {
        match self.validate_inner(user_id, fingerprint, token, ctx).await {
            Ok(valid) => valid,
            Err(e) => {
                // Trust must never fail a login; storage trouble just means
                // full MFA this time.
                tracing::warn!(%user_id, error = %e, "Trust validation errored, requiring MFA");
                false
            }
        }
    }

    /// Strict form of [`validate_trust`] for callers that want the error:
    /// any mismatch or expiry is `TrustInvalid`.
    ///
    /// [`validate_trust`]: TrustedDeviceManager::validate_trust
    pub async fn require_trust(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        token: &str,
        ctx: &ClientContext,
    ) -> Result<(), CoreError> {
        if self.validate_trust(user_id, fingerprint, token, ctx).await {
            Ok(())
        } else {
            Err(CoreError::TrustInvalid)
        }
    }

    async fn validate_inner(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        token: &str,
        ctx: &ClientContext,
    ) -> Result<bool, CoreError> {
        let Some(device) = self.storage.trusted_device(user_id, fingerprint).await? else {
            return Ok(false);
        };

        if device.is_expired() {
            return Ok(false);
        }
        if !codes::constant_time_eq(&codes::hash_code(token), &device.token_hash) {
            return Ok(false);
        }

        let new_expiry = self
            .sliding
            .then(|| Utc::now() + ChronoDuration::days(self.trust_ttl_days));
        self.storage
            .touch_trusted_device(device.device_id, ctx, new_expiry)
            .await?;

        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::TrustValidated,
                Some(serde_json::json!({ "fingerprint": fingerprint })),
                ctx,
            ))
            .await?;

        Ok(true)
    }

    pub async fn revoke(
        &self,
        user_id: Uuid,
        fingerprint: &str,
        ctx: &ClientContext,
    ) -> Result<bool, CoreError> {
        let removed = self.storage.delete_trusted_device(user_id, fingerprint).await?;
        if removed > 0 {
            self.events
                .record(SecurityEvent::user_action(
                    user_id,
                    SecurityEventType::TrustRevoked,
                    Some(serde_json::json!({ "fingerprint": fingerprint })),
                    ctx,
                ))
                .await?;
        }
        Ok(removed > 0)
    }

    /// Drop every trust grant for the user, e.g. after a password change.
    pub async fn revoke_all(&self, user_id: Uuid, ctx: &ClientContext) -> Result<u64, CoreError> {
        let removed = self.storage.delete_trusted_devices_for_user(user_id).await?;
        if removed > 0 {
            self.events
                .record(SecurityEvent::user_action(
                    user_id,
                    SecurityEventType::TrustRevoked,
                    Some(serde_json::json!({ "revoked": removed })),
                    ctx,
                ))
                .await?;
        }
        Ok(removed)
    }
}
