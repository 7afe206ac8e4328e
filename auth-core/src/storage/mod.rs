//! Persistence boundary for the security core.
//!
//! Services depend on [`AuthStorage`] so tests can run against the
//! in-memory implementation while deployments use Postgres. One-shot state
//! transitions (backup-code redemption) are expressed as conditional updates
//! inside the store, never as read-then-write sequences in callers.

mod memory;
mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PgStorage;

use crate::error::CoreError;
use crate::models::{
    AuthAttempt, BackupCode, ClientContext, MfaDevice, MfaMethod, SecurityEvent, TrustedDevice,
    UserMfa, VerificationCode,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Aggregated counts backing operational dashboards. Derived, read-only,
/// not authoritative.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DashboardStats {
    pub users_with_mfa: i64,
    pub users_without_mfa: i64,
    pub totp_devices: i64,
    pub sms_devices: i64,
    pub email_devices: i64,
    pub attempts_succeeded_24h: i64,
    pub attempts_failed_24h: i64,
}

#[async_trait]
pub trait AuthStorage: Send + Sync {
    // Users: this core only touches the two MFA columns of the external
    // users table. Unknown users read as the MFA-disabled default.
    async fn user_mfa(&self, user_id: Uuid) -> Result<UserMfa, CoreError>;
    async fn set_user_mfa(&self, user_id: Uuid, mfa: &UserMfa) -> Result<(), CoreError>;

    // MFA devices.
    async fn insert_device(&self, device: &MfaDevice) -> Result<(), CoreError>;
    async fn device_by_id(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<MfaDevice>, CoreError>;
    async fn active_device(
        &self,
        user_id: Uuid,
        kind: MfaMethod,
    ) -> Result<Option<MfaDevice>, CoreError>;
    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<MfaDevice>, CoreError>;
    async fn mark_device_active(&self, device_id: Uuid) -> Result<(), CoreError>;
    async fn mark_device_disabled(&self, device_id: Uuid) -> Result<(), CoreError>;
    async fn touch_device_used(&self, device_id: Uuid) -> Result<(), CoreError>;

    // Backup codes.
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: &[BackupCode],
    ) -> Result<(), CoreError>;
    /// Atomic `active -> used` transition. Exactly one concurrent caller
    /// with the same hash observes `true`.
    async fn redeem_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool, CoreError>;
    async fn active_backup_code_count(&self, user_id: Uuid) -> Result<i64, CoreError>;

    // Verification codes (durable audit trail; consumption is in the cache).
    async fn insert_verification_code(&self, code: &VerificationCode) -> Result<(), CoreError>;
    /// Expire every unused, unexpired code for the pair. Returns the count.
    async fn supersede_verification_codes(
        &self,
        user_id: Uuid,
        method: MfaMethod,
    ) -> Result<u64, CoreError>;
    async fn mark_verification_code_used(&self, code_id: Uuid) -> Result<(), CoreError>;

    // Auth attempts.
    async fn insert_attempt(&self, attempt: &AuthAttempt) -> Result<(), CoreError>;
    async fn attempts_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuthAttempt>, CoreError>;

    // Trusted devices.
    async fn upsert_trusted_device(&self, device: &TrustedDevice) -> Result<(), CoreError>;
    async fn trusted_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, CoreError>;
    async fn touch_trusted_device(
        &self,
        device_id: Uuid,
        ctx: &ClientContext,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError>;
    async fn delete_trusted_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<u64, CoreError>;
    async fn delete_trusted_devices_for_user(&self, user_id: Uuid) -> Result<u64, CoreError>;

    // Security events.
    async fn insert_event(&self, event: &SecurityEvent) -> Result<(), CoreError>;
    async fn events_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, CoreError>;

    // Cleanup. All deletions are idempotent.
    async fn purge_expired_verification_codes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError>;
    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError>;
    async fn purge_expired_trusted_devices(&self) -> Result<u64, CoreError>;

    async fn dashboard_stats(&self) -> Result<DashboardStats, CoreError>;
}
