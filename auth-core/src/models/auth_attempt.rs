//! Auth attempt model - append-only record of authentication outcomes.

use crate::models::{ClientContext, MfaMethod};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// One authentication attempt. Feeds rate-limit decisions and audit views;
/// purged after the retention window by the cleanup sweeper.
#[derive(Debug, Clone, FromRow)]
pub struct AuthAttempt {
    pub attempt_id: Uuid,
    pub user_id: Uuid,
    /// The factor that was exercised; `None` for a plain credential login.
    pub method_code: Option<String>,
    pub success: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl AuthAttempt {
    pub fn new(
        user_id: Uuid,
        method: Option<MfaMethod>,
        success: bool,
        ctx: &ClientContext,
    ) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            user_id,
            method_code: method.map(|m| m.as_str().to_string()),
            success,
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            attempted_at: Utc::now(),
        }
    }
}
