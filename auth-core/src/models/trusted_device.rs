//! Trusted device model - long-lived MFA-skip grants.

use chrono::{DateTime, Duration, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Trusted device entity. The fingerprint is a derived identifier, never
/// reversible to PII, and `(user_id, device_fingerprint)` is unique. Only
/// the trust token's hash is stored.
#[derive(Debug, Clone, FromRow)]
pub struct TrustedDevice {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub device_fingerprint: String,
    pub token_hash: String,
    pub last_ip_address: Option<String>,
    pub last_user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl TrustedDevice {
    pub fn new(
        user_id: Uuid,
        device_fingerprint: String,
        token_hash: String,
        ttl_days: i64,
    ) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            user_id,
            device_fingerprint,
            token_hash,
            last_ip_address: None,
            last_user_agent: None,
            created_at: Utc::now(),
            last_used_at: None,
            expires_at: Utc::now() + Duration::days(ttl_days),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}
