//! Verification code model - short-lived codes for sms/email factors.

use crate::models::MfaMethod;
use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Verification code entity. Authoritative single-use consumption happens in
/// the cache substrate; these rows are the durable audit trail the cleanup
/// sweeper ages out.
#[derive(Debug, Clone, FromRow)]
pub struct VerificationCode {
    pub code_id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub method_code: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl VerificationCode {
    pub fn new(user_id: Uuid, method: MfaMethod, code_hash: String, ttl_seconds: i64) -> Self {
        Self {
            code_id: Uuid::new_v4(),
            user_id,
            code_hash,
            method_code: method.as_str().to_string(),
            expires_at: Utc::now() + Duration::seconds(ttl_seconds),
            used_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }
}
