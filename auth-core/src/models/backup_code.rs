//! Backup code model - one-time recovery codes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupCodeStatus {
    Active,
    Used,
    Disabled,
}

impl BackupCodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupCodeStatus::Active => "active",
            BackupCodeStatus::Used => "used",
            BackupCodeStatus::Disabled => "disabled",
        }
    }
}

/// Backup code entity. Only the one-way hash is stored; the plaintext is
/// shown to the user once at generation time.
#[derive(Debug, Clone, FromRow)]
pub struct BackupCode {
    pub code_id: Uuid,
    pub user_id: Uuid,
    pub code_hash: String,
    pub status_code: String,
    pub created_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl BackupCode {
    pub fn new(user_id: Uuid, code_hash: String) -> Self {
        Self {
            code_id: Uuid::new_v4(),
            user_id,
            code_hash,
            status_code: BackupCodeStatus::Active.as_str().to_string(),
            created_at: Utc::now(),
            used_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status_code == BackupCodeStatus::Active.as_str()
    }
}
