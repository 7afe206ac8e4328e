//! MFA device model - enrolled second factors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Supported second-factor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MfaMethod {
    Totp,
    Sms,
    Email,
}

impl MfaMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MfaMethod::Totp => "totp",
            MfaMethod::Sms => "sms",
            MfaMethod::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "totp" => Some(MfaMethod::Totp),
            "sms" => Some(MfaMethod::Sms),
            "email" => Some(MfaMethod::Email),
            _ => None,
        }
    }
}

/// Device lifecycle states. `Disabled` is terminal; restoring a method
/// requires enrolling a new device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Active,
    Disabled,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Pending => "pending",
            DeviceStatus::Active => "active",
            DeviceStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeviceStatus::Pending),
            "active" => Some(DeviceStatus::Active),
            "disabled" => Some(DeviceStatus::Disabled),
            _ => None,
        }
    }
}

/// Closed metadata set captured at enrollment time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MfaDeviceMetadata {
    pub enrolled_ip: Option<String>,
    pub enrolled_user_agent: Option<String>,
}

/// MFA device entity. Rows are never hard-deleted; queries filter by status.
#[derive(Debug, Clone, FromRow)]
pub struct MfaDevice {
    pub device_id: Uuid,
    pub user_id: Uuid,
    pub kind_code: String,
    pub display_name: String,
    /// Encrypted TOTP secret; present only for `totp` devices.
    pub secret_enc: Option<String>,
    /// Destination number; present only for `sms` devices.
    pub phone_number: Option<String>,
    pub status_code: String,
    #[sqlx(json)]
    pub metadata: MfaDeviceMetadata,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl MfaDevice {
    /// Create a new device in `pending` state.
    pub fn new(
        user_id: Uuid,
        kind: MfaMethod,
        display_name: String,
        secret_enc: Option<String>,
        phone_number: Option<String>,
        metadata: MfaDeviceMetadata,
    ) -> Self {
        Self {
            device_id: Uuid::new_v4(),
            user_id,
            kind_code: kind.as_str().to_string(),
            display_name,
            secret_enc,
            phone_number,
            status_code: DeviceStatus::Pending.as_str().to_string(),
            metadata,
            created_at: Utc::now(),
            verified_at: None,
            disabled_at: None,
            last_used_at: None,
        }
    }

    pub fn kind(&self) -> Option<MfaMethod> {
        MfaMethod::parse(&self.kind_code)
    }

    pub fn status(&self) -> Option<DeviceStatus> {
        DeviceStatus::parse(&self.status_code)
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Some(DeviceStatus::Pending)
    }

    pub fn is_active(&self) -> bool {
        self.status() == Some(DeviceStatus::Active)
    }
}
