//! Append-only security event log.
//!
//! Every state transition in the MFA, session, trust, and backup-code
//! services lands here, plus the cleanup sweeper's own summaries.

use crate::error::CoreError;
use crate::models::{AuthAttempt, SecurityEvent};
use crate::storage::AuthStorage;
use std::sync::Arc;

#[derive(Clone)]
pub struct SecurityEventLog {
    storage: Arc<dyn AuthStorage>,
}

impl SecurityEventLog {
    pub fn new(storage: Arc<dyn AuthStorage>) -> Self {
        Self { storage }
    }

    /// Append an event, waiting for durability.
    pub async fn record(&self, event: SecurityEvent) -> Result<(), CoreError> {
        tracing::info!(
            event_type = %event.event_type_code,
            user_id = ?event.user_id,
            "Security event"
        );
        self.storage.insert_event(&event).await
    }

    /// Append an event without blocking the caller. Used on paths that must
    /// not gain latency from audit writes, such as rate-limit denials.
    pub fn record_detached(&self, event: SecurityEvent) {
        let storage = self.storage.clone();
        tokio::spawn(async move {
            if let Err(e) = storage.insert_event(&event).await {
                tracing::error!(
                    error = %e,
                    event_type = %event.event_type_code,
                    "Failed to write security event"
                );
            }
        });
    }

    /// Append an authentication attempt row.
    pub async fn record_attempt(&self, attempt: AuthAttempt) -> Result<(), CoreError> {
        self.storage.insert_attempt(&attempt).await
    }
}
