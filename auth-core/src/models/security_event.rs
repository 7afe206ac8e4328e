//! Security event model - append-only audit trail.

use crate::models::ClientContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Security event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    DeviceEnrollmentStarted,
    DeviceActivated,
    DeviceDisabled,
    MfaVerifySucceeded,
    MfaVerifyFailed,
    VerificationCodeIssued,
    VerificationCodeConsumed,
    BackupCodesGenerated,
    BackupCodeRedeemed,
    TrustGranted,
    TrustValidated,
    TrustRevoked,
    SessionCreated,
    SessionsInvalidated,
    RateLimitTripped,
    CleanupCompleted,
}

impl SecurityEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityEventType::DeviceEnrollmentStarted => "device_enrollment_started",
            SecurityEventType::DeviceActivated => "device_activated",
            SecurityEventType::DeviceDisabled => "device_disabled",
            SecurityEventType::MfaVerifySucceeded => "mfa_verify_succeeded",
            SecurityEventType::MfaVerifyFailed => "mfa_verify_failed",
            SecurityEventType::VerificationCodeIssued => "verification_code_issued",
            SecurityEventType::VerificationCodeConsumed => "verification_code_consumed",
            SecurityEventType::BackupCodesGenerated => "backup_codes_generated",
            SecurityEventType::BackupCodeRedeemed => "backup_code_redeemed",
            SecurityEventType::TrustGranted => "trust_granted",
            SecurityEventType::TrustValidated => "trust_validated",
            SecurityEventType::TrustRevoked => "trust_revoked",
            SecurityEventType::SessionCreated => "session_created",
            SecurityEventType::SessionsInvalidated => "sessions_invalidated",
            SecurityEventType::RateLimitTripped => "rate_limit_tripped",
            SecurityEventType::CleanupCompleted => "cleanup_completed",
        }
    }
}

/// Security event entity. Appended on every state transition in the core;
/// never mutated afterwards.
#[derive(Debug, Clone, FromRow)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    /// `None` for system-level events such as cleanup summaries.
    pub user_id: Option<Uuid>,
    pub event_type_code: String,
    pub event_data: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SecurityEvent {
    /// Create an event attributed to a user action.
    pub fn user_action(
        user_id: Uuid,
        event_type: SecurityEventType,
        event_data: Option<serde_json::Value>,
        ctx: &ClientContext,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            user_id: Some(user_id),
            event_type_code: event_type.as_str().to_string(),
            event_data,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            created_at: Utc::now(),
        }
    }

    /// Create a system-level event (no acting user).
    pub fn system_action(
        event_type: SecurityEventType,
        event_data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            user_id: None,
            event_type_code: event_type.as_str().to_string(),
            event_data,
            ip_address: None,
            user_agent: None,
            created_at: Utc::now(),
        }
    }
}
