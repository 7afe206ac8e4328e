pub mod auth_attempt;
pub mod backup_code;
pub mod mfa_device;
pub mod security_event;
pub mod trusted_device;
pub mod user;
pub mod verification_code;

pub use auth_attempt::AuthAttempt;
pub use backup_code::{BackupCode, BackupCodeStatus};
pub use mfa_device::{DeviceStatus, MfaDevice, MfaDeviceMetadata, MfaMethod};
pub use security_event::{SecurityEvent, SecurityEventType};
pub use trusted_device::TrustedDevice;
pub use user::UserMfa;
pub use verification_code::VerificationCode;

use serde::{Deserialize, Serialize};

/// Request-scoped client attribution attached to attempts, events, and
/// trusted-device bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientContext {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl ClientContext {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent: Some(user_agent.into()),
        }
    }
}
