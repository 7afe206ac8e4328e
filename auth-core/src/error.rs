//! Error taxonomy for the authentication security core.
//!
//! Validation and not-found style failures are recovered locally into denial
//! decisions by the services and never reach callers as errors; the variants
//! here are what boundary services must handle. User-facing text stays
//! generic so internal detail never reveals which sub-check failed.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller must wait before retrying. Carries a retry-after hint.
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimitExceeded { retry_after: Duration },

    /// A required critical section could not be entered in time. The caller
    /// should retry the whole operation later, not partially proceed.
    #[error("Lock unavailable for resource: {0}")]
    LockUnavailable(String),

    /// Enrollment attempted while an active device of the same kind exists.
    #[error("An active device of this kind is already enrolled")]
    DeviceConflict,

    /// Unknown device identifier. Returned indistinguishably from a wrong
    /// proof wherever enumeration would otherwise be possible.
    #[error("Device not found")]
    DeviceNotFound,

    /// Verification or backup code is expired, already consumed, or unknown.
    #[error("Code expired or already used")]
    CodeExpiredOrUsed,

    /// Trust token/fingerprint mismatch or expired trust. Callers must fall
    /// back to full MFA, never fail the login on this.
    #[error("Trust token invalid")]
    TrustInvalid,

    /// Shared cache unreachable and the operation could not be satisfied in
    /// degraded mode. Logged, not surfaced to end users.
    #[error("Shared store degraded: {0}")]
    StoreDegraded(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(anyhow::Error),

    #[error("Cryptography error: {0}")]
    Crypto(anyhow::Error),

    #[error("Configuration error: {0}")]
    Config(anyhow::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Cache(anyhow::Error::new(err))
    }
}

impl CoreError {
    /// Whether the error is an infrastructure failure the boundary should
    /// treat as fail-closed, as opposed to a local denial decision.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            CoreError::LockUnavailable(_)
                | CoreError::StoreDegraded(_)
                | CoreError::Database(_)
                | CoreError::Cache(_)
                | CoreError::Crypto(_)
                | CoreError::Internal(_)
        )
    }
}
