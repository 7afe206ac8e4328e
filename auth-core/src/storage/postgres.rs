//! PostgreSQL storage backend.

use super::{AuthStorage, DashboardStats};
use crate::error::CoreError;
use crate::models::{
    AuthAttempt, BackupCode, ClientContext, MfaDevice, MfaMethod, SecurityEvent, TrustedDevice,
    UserMfa, VerificationCode,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

/// PostgreSQL storage wrapper.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AuthStorage for PgStorage {
    async fn user_mfa(&self, user_id: Uuid) -> Result<UserMfa, CoreError> {
        let row: Option<(bool, Vec<String>)> = sqlx::query_as(
            "SELECT mfa_enabled, mfa_methods FROM users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .map(|(enabled, methods)| UserMfa {
                mfa_enabled: enabled,
                mfa_methods: methods.iter().filter_map(|m| MfaMethod::parse(m)).collect(),
            })
            .unwrap_or_default())
    }

    async fn set_user_mfa(&self, user_id: Uuid, mfa: &UserMfa) -> Result<(), CoreError> {
        let methods: Vec<String> = mfa
            .mfa_methods
            .iter()
            .map(|m| m.as_str().to_string())
            .collect();
        sqlx::query("UPDATE users SET mfa_enabled = $2, mfa_methods = $3 WHERE user_id = $1")
            .bind(user_id)
            .bind(mfa.mfa_enabled)
            .bind(&methods)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_device(&self, device: &MfaDevice) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_devices
                (device_id, user_id, kind_code, display_name, secret_enc, phone_number,
                 status_code, metadata, created_at, verified_at, disabled_at, last_used_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(device.device_id)
        .bind(device.user_id)
        .bind(&device.kind_code)
        .bind(&device.display_name)
        .bind(&device.secret_enc)
        .bind(&device.phone_number)
        .bind(&device.status_code)
        .bind(Json(&device.metadata))
        .bind(device.created_at)
        .bind(device.verified_at)
        .bind(device.disabled_at)
        .bind(device.last_used_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn device_by_id(
        &self,
        user_id: Uuid,
        device_id: Uuid,
    ) -> Result<Option<MfaDevice>, CoreError> {
        let device = sqlx::query_as::<_, MfaDevice>(
            "SELECT * FROM mfa_devices WHERE user_id = $1 AND device_id = $2",
        )
        .bind(user_id)
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn active_device(
        &self,
        user_id: Uuid,
        kind: MfaMethod,
    ) -> Result<Option<MfaDevice>, CoreError> {
        let device = sqlx::query_as::<_, MfaDevice>(
            "SELECT * FROM mfa_devices WHERE user_id = $1 AND kind_code = $2 AND status_code = 'active'",
        )
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<MfaDevice>, CoreError> {
        let devices = sqlx::query_as::<_, MfaDevice>(
            "SELECT * FROM mfa_devices WHERE user_id = $1 ORDER BY created_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }

    async fn mark_device_active(&self, device_id: Uuid) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE mfa_devices SET status_code = 'active', verified_at = NOW() WHERE device_id = $1",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_device_disabled(&self, device_id: Uuid) -> Result<(), CoreError> {
        sqlx::query(
            "UPDATE mfa_devices SET status_code = 'disabled', disabled_at = NOW() WHERE device_id = $1",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_device_used(&self, device_id: Uuid) -> Result<(), CoreError> {
        sqlx::query("UPDATE mfa_devices SET last_used_at = NOW() WHERE device_id = $1")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: &[BackupCode],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE mfa_backup_codes SET status_code = 'disabled' WHERE user_id = $1 AND status_code = 'active'",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        for code in codes {
            sqlx::query(
                r#"
                INSERT INTO mfa_backup_codes (code_id, user_id, code_hash, status_code, created_at, used_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(code.code_id)
            .bind(code.user_id)
            .bind(&code.code_hash)
            .bind(&code.status_code)
            .bind(code.created_at)
            .bind(code.used_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn redeem_backup_code(&self, user_id: Uuid, code_hash: &str) -> Result<bool, CoreError> {
        // Single conditional UPDATE: exactly one concurrent redeemer wins.
        let result = sqlx::query(
            r#"
            UPDATE mfa_backup_codes
            SET status_code = 'used', used_at = NOW()
            WHERE user_id = $1 AND code_hash = $2 AND status_code = 'active'
            "#,
        )
        .bind(user_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn active_backup_code_count(&self, user_id: Uuid) -> Result<i64, CoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM mfa_backup_codes WHERE user_id = $1 AND status_code = 'active'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn insert_verification_code(&self, code: &VerificationCode) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_verification_codes
                (code_id, user_id, code_hash, method_code, expires_at, used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(code.code_id)
        .bind(code.user_id)
        .bind(&code.code_hash)
        .bind(&code.method_code)
        .bind(code.expires_at)
        .bind(code.used_at)
        .bind(code.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn supersede_verification_codes(
        &self,
        user_id: Uuid,
        method: MfaMethod,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            r#"
            UPDATE mfa_verification_codes
            SET expires_at = NOW()
            WHERE user_id = $1 AND method_code = $2 AND used_at IS NULL AND expires_at > NOW()
            "#,
        )
        .bind(user_id)
        .bind(method.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_verification_code_used(&self, code_id: Uuid) -> Result<(), CoreError> {
        sqlx::query("UPDATE mfa_verification_codes SET used_at = NOW() WHERE code_id = $1")
            .bind(code_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &AuthAttempt) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_auth_attempts
                (attempt_id, user_id, method_code, success, ip_address, user_agent, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(attempt.attempt_id)
        .bind(attempt.user_id)
        .bind(&attempt.method_code)
        .bind(attempt.success)
        .bind(&attempt.ip_address)
        .bind(&attempt.user_agent)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn attempts_for_user(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<AuthAttempt>, CoreError> {
        let attempts = sqlx::query_as::<_, AuthAttempt>(
            "SELECT * FROM mfa_auth_attempts WHERE user_id = $1 AND attempted_at >= $2 ORDER BY attempted_at DESC",
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn upsert_trusted_device(&self, device: &TrustedDevice) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_trusted_devices
                (device_id, user_id, device_fingerprint, token_hash, last_ip_address,
                 last_user_agent, created_at, last_used_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, device_fingerprint) DO UPDATE
            SET token_hash = EXCLUDED.token_hash,
                last_ip_address = EXCLUDED.last_ip_address,
                last_user_agent = EXCLUDED.last_user_agent,
                last_used_at = EXCLUDED.last_used_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(device.device_id)
        .bind(device.user_id)
        .bind(&device.device_fingerprint)
        .bind(&device.token_hash)
        .bind(&device.last_ip_address)
        .bind(&device.last_user_agent)
        .bind(device.created_at)
        .bind(device.last_used_at)
        .bind(device.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn trusted_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, CoreError> {
        let device = sqlx::query_as::<_, TrustedDevice>(
            "SELECT * FROM mfa_trusted_devices WHERE user_id = $1 AND device_fingerprint = $2",
        )
        .bind(user_id)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(device)
    }

    async fn touch_trusted_device(
        &self,
        device_id: Uuid,
        ctx: &ClientContext,
        new_expiry: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            UPDATE mfa_trusted_devices
            SET last_used_at = NOW(),
                last_ip_address = $2,
                last_user_agent = $3,
                expires_at = COALESCE($4, expires_at)
            WHERE device_id = $1
            "#,
        )
        .bind(device_id)
        .bind(&ctx.ip_address)
        .bind(&ctx.user_agent)
        .bind(new_expiry)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_trusted_device(
        &self,
        user_id: Uuid,
        fingerprint: &str,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query(
            "DELETE FROM mfa_trusted_devices WHERE user_id = $1 AND device_fingerprint = $2",
        )
        .bind(user_id)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_trusted_devices_for_user(&self, user_id: Uuid) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM mfa_trusted_devices WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_event(&self, event: &SecurityEvent) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO mfa_security_events
                (event_id, user_id, event_type_code, event_data, ip_address, user_agent, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.event_id)
        .bind(event.user_id)
        .bind(&event.event_type_code)
        .bind(&event.event_data)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<SecurityEvent>, CoreError> {
        let events = sqlx::query_as::<_, SecurityEvent>(
            "SELECT * FROM mfa_security_events WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn purge_expired_verification_codes(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM mfa_verification_codes WHERE expires_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_attempts_before(&self, cutoff: DateTime<Utc>) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM mfa_auth_attempts WHERE attempted_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired_trusted_devices(&self) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM mfa_trusted_devices WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, CoreError> {
        let row: (i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT users_with_mfa, users_without_mfa, totp_devices, sms_devices,
                   email_devices, attempts_succeeded_24h, attempts_failed_24h
            FROM mfa_dashboard_stats
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DashboardStats {
            users_with_mfa: row.0,
            users_without_mfa: row.1,
            totp_devices: row.2,
            sms_devices: row.3,
            email_devices: row.4,
            attempts_succeeded_24h: row.5,
            attempts_failed_24h: row.6,
        })
    }
}
