//! Login-flow orchestration across the security components.
//!
//! The boundary service authenticates credentials itself (out of scope
//! here) and drives this façade around it: limits first, then the MFA
//! decision, then session issuance. Trusted devices short-circuit the
//! verify step; trust failures fall through to full MFA, never to a failed
//! login.

use crate::error::CoreError;
use crate::models::{
    AuthAttempt, ClientContext, MfaMethod, SecurityEvent, SecurityEventType,
};
use crate::services::backup::BackupCodeManager;
use crate::services::events::SecurityEventLog;
use crate::services::mfa::MfaDeviceManager;
use crate::services::rate_limit::{RateLimitStrategy, RateLimiter};
use crate::services::session::{Session, SessionMetadata, SessionStore};
use crate::services::trusted_device::TrustedDeviceManager;
use std::time::Duration;
use uuid::Uuid;

/// Trust material presented by a returning device.
#[derive(Debug, Clone)]
pub struct TrustPresentation {
    pub fingerprint: String,
    pub token: String,
}

/// Second-factor proof supplied to finish a login.
#[derive(Debug, Clone)]
pub enum LoginProof {
    Factor(MfaMethod, String),
    BackupCode(String),
}

/// Outcome of the post-credential step.
#[derive(Debug, Clone)]
pub enum LoginGate {
    SessionIssued(Box<Session>),
    MfaRequired(Vec<MfaMethod>),
}

/// Successful MFA completion: the session plus, when requested, a fresh
/// trust token for the device.
#[derive(Debug, Clone)]
pub struct MfaLogin {
    pub session: Session,
    pub trust_token: Option<String>,
}

/// Per-dimension login rate limits.
#[derive(Debug, Clone)]
pub struct LoginLimits {
    pub ip_limit: u32,
    pub ip_window: Duration,
    pub user_limit: u32,
    pub user_window: Duration,
}

#[derive(Clone)]
pub struct LoginService {
    rate_limiter: RateLimiter,
    sessions: SessionStore,
    mfa: MfaDeviceManager,
    trusted: TrustedDeviceManager,
    backup: BackupCodeManager,
    events: SecurityEventLog,
    limits: LoginLimits,
}

impl LoginService {
    pub fn new(
        rate_limiter: RateLimiter,
        sessions: SessionStore,
        mfa: MfaDeviceManager,
        trusted: TrustedDeviceManager,
        backup: BackupCodeManager,
        events: SecurityEventLog,
        limits: LoginLimits,
    ) -> Self {
        Self {
            rate_limiter,
            sessions,
            mfa,
            trusted,
            backup,
            events,
            limits,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Gate a login request before any credential check: per-IP and, once
    /// the account is identified, per-user.
    pub async fn check_login_allowed(
        &self,
        ip: Option<&str>,
        user_id: Option<Uuid>,
    ) -> Result<(), CoreError> {
        if let Some(ip) = ip {
            self.rate_limiter
                .enforce(
                    &format!("login:ip:{}", ip),
                    self.limits.ip_limit,
                    self.limits.ip_window,
                    RateLimitStrategy::SlidingWindow,
                )
                .await?;
        }
        if let Some(user_id) = user_id {
            self.rate_limiter
                .enforce(
                    &format!("login:user:{}", user_id),
                    self.limits.user_limit,
                    self.limits.user_window,
                    RateLimitStrategy::FixedWindow,
                )
                .await?;
        }
        Ok(())
    }

    /// Decide what happens after a successful credential check: a session
    /// right away (no MFA, or a trusted device), or an MFA challenge.
    pub async fn post_credential(
        &self,
        user_id: Uuid,
        metadata: SessionMetadata,
        ctx: &ClientContext,
        trust: Option<&TrustPresentation>,
    ) -> Result<LoginGate, CoreError> {
        let Some(methods) = self.mfa.require_mfa(user_id).await? else {
            // Credential-only login: the attempt carries no method.
            self.events
                .record_attempt(AuthAttempt::new(user_id, None, true, ctx))
                .await?;
            let session = self.issue_session(user_id, metadata, ctx).await?;
            return Ok(LoginGate::SessionIssued(Box::new(session)));
        };

        if let Some(trust) = trust {
            if self
                .trusted
                .validate_trust(user_id, &trust.fingerprint, &trust.token, ctx)
                .await
            {
                self.events
                    .record_attempt(AuthAttempt::new(user_id, None, true, ctx))
                    .await?;
                let session = self.issue_session(user_id, metadata, ctx).await?;
                return Ok(LoginGate::SessionIssued(Box::new(session)));
            }
        }

        Ok(LoginGate::MfaRequired(methods))
    }

    /// Verify the second factor and, on success, issue the session and
    /// optionally a trust grant for this device. `None` means the proof
    /// was wrong; the caller re-challenges.
    pub async fn complete_mfa(
        &self,
        user_id: Uuid,
        proof: LoginProof,
        metadata: SessionMetadata,
        ctx: &ClientContext,
        trust_fingerprint: Option<&str>,
    ) -> Result<Option<MfaLogin>, CoreError> {
        let verified = match &proof {
            LoginProof::Factor(kind, code) => self.mfa.verify(user_id, *kind, code, ctx).await?,
            LoginProof::BackupCode(code) => self.backup.redeem(user_id, code, ctx).await?,
        };
        if !verified {
            return Ok(None);
        }

        let session = self.issue_session(user_id, metadata, ctx).await?;
        let trust_token = match trust_fingerprint {
            Some(fingerprint) => Some(self.trusted.issue_trust(user_id, fingerprint, ctx).await?),
            None => None,
        };

        Ok(Some(MfaLogin {
            session,
            trust_token,
        }))
    }

    /// Forced invalidation: log out everywhere, e.g. after a password
    /// change or suspected compromise.
    pub async fn logout_everywhere(
        &self,
        user_id: Uuid,
        ctx: &ClientContext,
    ) -> Result<u64, CoreError> {
        let removed = self.sessions.delete_all_for_user(user_id).await?;
        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::SessionsInvalidated,
                Some(serde_json::json!({ "sessions_removed": removed })),
                ctx,
            ))
            .await?;
        Ok(removed)
    }

    async fn issue_session(
        &self,
        user_id: Uuid,
        metadata: SessionMetadata,
        ctx: &ClientContext,
    ) -> Result<Session, CoreError> {
        let session = self.sessions.create(user_id, metadata).await?;
        self.events
            .record(SecurityEvent::user_action(
                user_id,
                SecurityEventType::SessionCreated,
                None,
                ctx,
            ))
            .await?;
        Ok(session)
    }
}
