//! In-memory storage backend.
//!
//! Mirrors the Postgres semantics closely enough that every service-level
//! test can run without infrastructure. A single mutex over all tables makes
//! the conditional transitions atomic, matching what the SQL versions get
//! from single-statement updates.

use super::{AuthStorage, DashboardStats};
use crate::error::CoreError;
use crate::models::{
    AuthAttempt, BackupCode, BackupCodeStatus, ClientContext, DeviceStatus, MfaDevice, MfaMethod,
    SecurityEvent, TrustedDevice, UserMfa, VerificationCode,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, UserMfa>,
    devices: Vec<MfaDevice>,
    backup_codes: Vec<BackupCode>,
    verification_codes: Vec<VerificationCode>,
    attempts: Vec<AuthAttempt>,
    trusted_devices: Vec<TrustedDevice>,
    events: Vec<SecurityEvent>,
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Tables>, CoreError> {
        self.tables
            .lock()
            .map_err(|e| CoreError::Internal(anyhow::anyhow!("storage mutex poisoned: {}", e)))
    }
}

#[async_trait]
impl AuthStorage for MemoryStorage {
    async fn user_mfa(&self, user_id: Uuid) -> Result<UserMfa, CoreError> {
        let tables = self.lock()?;
        Ok(tables.users.get(&user_id).cloned().unwrap_or_default())
    }

    async fn set_user_mfa(&self, user_id: Uuid, mfa: &UserMfa) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        tables.users.insert(user_id, mfa.clone());
        Ok(())
    }

    async fn insert_device(&self, device: &MfaDevice) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        tables.devices.push(device.clone());
        Ok(())
    }

    async fn device_by_id(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<MfaDevice>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .devices
            .iter()
            .find(|d| d.user_id == user_id && d.device_id == device_id)
            .cloned())
    }

    async fn active_device(
        &self,
        user_id: Uuid,
        kind: MfaMethod,
    ) -> Result<Option<MfaDevice>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .devices
            .iter()
            .find(|d| d.user_id == user_id && d.kind_code == kind.as_str() && d.is_active())
            .cloned())
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<MfaDevice>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .devices
            .iter()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn mark_device_active(&self, device_id: Uuid) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        if let Some(device) = tables.devices.iter_mut().find(|d| d.device_id == device_id) {
            device.status_code = DeviceStatus::Active.as_str().to_string();
            device.verified_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_device_disabled(&self, device_id: Uuid) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        if let Some(device) = tables.devices.iter_mut().find(|d| d.device_id == device_id) {
            device.status_code = DeviceStatus::Disabled.as_str().to_string();
            device.disabled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn touch_device_used(&self, device_id: Uuid) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        if let Some(device) = tables.devices.iter_mut().find(|d| d.device_id == device_id) {
            device.last_used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: &[BackupCode],
    ) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        for code in tables
            .backup_codes
            .iter_mut()
            .filter(|c| c.user_id == user_id && c.is_active())
        {
            code.status_code = BackupCodeStatus::Disabled.as_str().to_string();
        }
        tables.backup_codes.extend_from_slice(codes);
        Ok(())
    }

    async fn redeem_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool, CoreError> {
        let mut tables = self.lock()?;
        match tables
            .backup_codes
            .iter_mut()
            .find(|c| c.user_id == user_id && c.code_hash == code_hash && c.is_active())
        {
            Some(code) => {
                code.status_code = BackupCodeStatus::Used.as_str().to_string();
                code.used_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_backup_code_count(&self, user_id: Uuid) -> Result<i64, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .backup_codes
            .iter()
            .filter(|c| c.user_id == user_id && c.is_active())
            .count() as i64)
    }

    async fn insert_verification_code(&self, code: &VerificationCode) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        tables.verification_codes.push(code.clone());
        Ok(())
    }

    async fn supersede_verification_codes(
        &self,
        user_id: Uuid,
        method: MfaMethod,
    ) -> Result<u64, CoreError> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let mut superseded = 0;
        for code in tables.verification_codes.iter_mut().filter(|c| {
            c.user_id == user_id
                && c.method_code == method.as_str()
                && c.used_at.is_none()
                && c.expires_at > now
        }) {
            code.expires_at = now;
            superseded += 1;
        }
        Ok(superseded)
    }

    async fn mark_verification_code_used(&self, code_id: Uuid) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        if let Some(code) = tables
            .verification_codes
            .iter_mut()
            .find(|c| c.code_id == code_id)
        {
            code.used_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &AuthAttempt) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        tables.attempts.push(attempt.clone());
        Ok(())
    }

    async fn attempts_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuthAttempt>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .attempts
            .iter()
            .filter(|a| a.user_id == user_id && a.attempted_at >= since)
            .cloned()
            .collect())
    }

    async fn upsert_trusted_device(&self, device: &TrustedDevice) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        tables.trusted_devices.retain(|d| {
            !(d.user_id == device.user_id && d.device_fingerprint == device.device_fingerprint)
        });
        tables.trusted_devices.push(device.clone());
        Ok(())
    }

    async fn trusted_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, CoreError> {
        let tables = self.lock()?;
        Ok(tables
            .trusted_devices
            .iter()
            .find(|d| d.user_id == user_id && d.device_fingerprint == fingerprint)
            .cloned())
    }

    async fn touch_trusted_device(
        &self,
        device_id: Uuid,
        ctx: &ClientContext,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        if let Some(device) = tables
            .trusted_devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
        {
            device.last_used_at = Some(Utc::now());
            device.last_ip_address = ctx.ip_address.clone();
            device.last_user_agent = ctx.user_agent.clone();
            if let Some(expiry) = new_expiry {
                device.expires_at = expiry;
            }
        }
        Ok(())
    }

    async fn delete_trusted_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<u64, CoreError> {
        let mut tables = self.lock()?;
        let before = tables.trusted_devices.len();
        tables
            .trusted_devices
            .retain(|d| !(d.user_id == user_id && d.device_fingerprint == fingerprint));
        Ok((before - tables.trusted_devices.len()) as u64)
    }

    async fn delete_trusted_devices_for_user(&self, user_id: Uuid) -> Result<u64, CoreError> {
        let mut tables = self.lock()?;
        let before = tables.trusted_devices.len();
        tables.trusted_devices.retain(|d| d.user_id != user_id);
        Ok((before - tables.trusted_devices.len()) as u64)
    }

    async fn insert_event(&self, event: &SecurityEvent) -> Result<(), CoreError> {
        let mut tables = self.lock()?;
        tables.events.push(event.clone());
        Ok(())
    }

    async fn events_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, CoreError> {
        let tables = self.lock()?;
        let mut events: Vec<SecurityEvent> = tables
            .events
            .iter()
            .filter(|e| e.user_id == Some(user_id))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn purge_expired_verification_codes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let mut tables = self.lock()?;
        let before = tables.verification_codes.len();
        tables.verification_codes.retain(|c| c.expires_at >= cutoff);
        Ok((before - tables.verification_codes.len()) as u64)
    }

    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let mut tables = self.lock()?;
        let before = tables.attempts.len();
        tables.attempts.retain(|a| a.attempted_at >= cutoff);
        Ok((before - tables.attempts.len()) as u64)
    }

    async fn purge_expired_trusted_devices(&self) -> Result<u64, CoreError> {
        let mut tables = self.lock()?;
        let now = Utc::now();
        let before = tables.trusted_devices.len();
        tables.trusted_devices.retain(|d| d.expires_at > now);
        Ok((before - tables.trusted_devices.len()) as u64)
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, CoreError> {
        let tables = self.lock()?;
        let day_ago = Utc::now() - Duration::hours(24);

        let count_kind = |kind: MfaMethod| {
            tables
                .devices
                .iter()
                .filter(|d| d.kind_code == kind.as_str() && d.is_active())
                .count() as i64
        };

        Ok(DashboardStats {
            users_with_mfa: tables.users.values().filter(|u| u.mfa_enabled).count() as i64,
            users_without_mfa: tables.users.values().filter(|u| !u.mfa_enabled).count() as i64,
            totp_devices: count_kind(MfaMethod::Totp),
            sms_devices: count_kind(MfaMethod::Sms),
            email_devices: count_kind(MfaMethod::Email),
            attempts_succeeded_24h: tables
                .attempts
                .iter()
                .filter(|a| a.attempted_at >= day_ago && a.success)
                .count() as i64,
            attempts_failed_24h: tables
                .attempts
                .iter()
                .filter(|a| a.attempted_at >= day_ago && !a.success)
                .count() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MfaDeviceMetadata;

    #[tokio::test]
    async fn backup_code_redeems_exactly_once() {
        let storage = MemoryStorage::new();
        let user = Uuid::new_v4();

        storage
            .replace_backup_codes(user, &[BackupCode::new(user, "h1".to_string())])
            .await
            .unwrap();

        assert!(storage.redeem_backup_code(user, "h1").await.unwrap());
        assert!(!storage.redeem_backup_code(user, "h1").await.unwrap());
        assert!(!storage.redeem_backup_code(user, "unknown").await.unwrap());
    }

    #[tokio::test]
    async fn replace_disables_the_previous_batch() {
        let storage = MemoryStorage::new();
        let user = Uuid::new_v4();

        storage
            .replace_backup_codes(user, &[BackupCode::new(user, "old".to_string())])
            .await
            .unwrap();
        storage
            .replace_backup_codes(user, &[BackupCode::new(user, "new".to_string())])
            .await
            .unwrap();

        assert!(!storage.redeem_backup_code(user, "old").await.unwrap());
        assert!(storage.redeem_backup_code(user, "new").await.unwrap());
    }

    #[tokio::test]
    async fn dashboard_stats_aggregate_users_devices_and_attempts() {
        let storage = MemoryStorage::new();
        let ctx = ClientContext::default();
        let enabled_user = Uuid::new_v4();
        let plain_user = Uuid::new_v4();

        let mut mfa = UserMfa::default();
        mfa.add_method(MfaMethod::Totp);
        storage.set_user_mfa(enabled_user, &mfa).await.unwrap();
        storage
            .set_user_mfa(plain_user, &UserMfa::default())
            .await
            .unwrap();

        let device = MfaDevice::new(
            enabled_user,
            MfaMethod::Totp,
            "Authenticator".to_string(),
            Some("enc".to_string()),
            None,
            MfaDeviceMetadata::default(),
        );
        storage.insert_device(&device).await.unwrap();
        storage.mark_device_active(device.device_id).await.unwrap();

        storage
            .insert_attempt(&AuthAttempt::new(enabled_user, Some(MfaMethod::Totp), true, &ctx))
            .await
            .unwrap();
        storage
            .insert_attempt(&AuthAttempt::new(enabled_user, Some(MfaMethod::Totp), false, &ctx))
            .await
            .unwrap();

        let stats = storage.dashboard_stats().await.unwrap();
        assert_eq!(stats.users_with_mfa, 1);
        assert_eq!(stats.users_without_mfa, 1);
        assert_eq!(stats.totp_devices, 1);
        assert_eq!(stats.sms_devices, 0);
        assert_eq!(stats.attempts_succeeded_24h, 1);
        assert_eq!(stats.attempts_failed_24h, 1);
    }
}
