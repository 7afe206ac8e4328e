//! Authentication security core.
//!
//! MFA device lifecycle, session management, distributed rate limiting,
//! trusted-device trust tokens, backup codes, and the shared cache/lock
//! substrate underneath them. This crate is a library: request handlers
//! owned elsewhere call into it, and credential checking stays with the
//! identity subsystem.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;

pub use error::CoreError;

use crate::cache::{CacheMode, CacheStore, HybridCache};
use crate::config::CoreConfig;
use crate::services::{
    BackupCodeManager, CleanupHandle, CleanupScheduler, CodeSender, DistributedLock, LoginLimits,
    LoginService, MfaDeviceManager, RateLimiter, SecurityEventLog, SessionStore, TotpService,
    TrustedDeviceManager, VerificationCodeService,
};
use crate::storage::{AuthStorage, PgStorage};
use std::sync::Arc;
use std::time::Duration;

/// Fully wired security core. Construction is plain dependency injection:
/// tests hand in an in-memory cache and storage, deployments use
/// [`AuthSecurityCore::connect`].
#[derive(Clone)]
pub struct AuthSecurityCore {
    cache: Arc<HybridCache>,
    pub storage: Arc<dyn AuthStorage>,
    pub events: SecurityEventLog,
    pub rate_limiter: RateLimiter,
    pub lock: DistributedLock,
    pub sessions: SessionStore,
    pub verification: VerificationCodeService,
    pub mfa: MfaDeviceManager,
    pub backup: BackupCodeManager,
    pub trusted: TrustedDeviceManager,
    pub login: LoginService,
    cleanup: Arc<CleanupScheduler>,
}

impl AuthSecurityCore {
    /// Wire every component against the given cache substrate and storage.
    pub fn new(
        config: &CoreConfig,
        cache: Arc<HybridCache>,
        storage: Arc<dyn AuthStorage>,
        sender: Arc<dyn CodeSender>,
    ) -> Result<Self, CoreError> {
        let cache_store: Arc<dyn CacheStore> = cache.clone();

        let events = SecurityEventLog::new(storage.clone());
        let rate_limiter = RateLimiter::new(cache_store.clone());
        let lock = DistributedLock::new(cache_store.clone());
        let sessions = SessionStore::new(
            cache_store.clone(),
            config.session_ttl(),
            config.refresh_ttl(),
        );

        let verification = VerificationCodeService::new(
            cache_store,
            storage.clone(),
            events.clone(),
            rate_limiter.clone(),
            sender,
            config.verification_code_ttl(),
            config.mfa.verification_code_length,
            config.rate_limit.code_issue_limit,
            Duration::from_secs(config.rate_limit.code_issue_window_seconds),
            config.rate_limit.mfa_verify_limit,
            Duration::from_secs(config.rate_limit.mfa_verify_window_seconds),
        );

        let totp = TotpService::from_hex_key(
            config.mfa.totp_issuer.clone(),
            &config.mfa.secret_key_hex,
        )?;
        let mfa = MfaDeviceManager::new(
            storage.clone(),
            events.clone(),
            rate_limiter.clone(),
            totp,
            verification.clone(),
            config.rate_limit.mfa_verify_limit,
            Duration::from_secs(config.rate_limit.mfa_verify_window_seconds),
        );

        let backup = BackupCodeManager::new(
            storage.clone(),
            events.clone(),
            lock.clone(),
            rate_limiter.clone(),
            config.rate_limit.mfa_verify_limit,
            Duration::from_secs(config.rate_limit.mfa_verify_window_seconds),
        );

        let trusted = TrustedDeviceManager::new(
            storage.clone(),
            events.clone(),
            config.mfa.trust_ttl_days,
            config.mfa.trust_sliding,
        );

        let login = LoginService::new(
            rate_limiter.clone(),
            sessions.clone(),
            mfa.clone(),
            trusted.clone(),
            backup.clone(),
            events.clone(),
            LoginLimits {
                ip_limit: config.rate_limit.login_ip_limit,
                ip_window: Duration::from_secs(config.rate_limit.login_ip_window_seconds),
                user_limit: config.rate_limit.login_user_limit,
                user_window: Duration::from_secs(config.rate_limit.login_user_window_seconds),
            },
        );

        let cleanup = Arc::new(CleanupScheduler::new(
            storage.clone(),
            events.clone(),
            config.cleanup.clone(),
        ));

        Ok(Self {
            cache,
            storage,
            events,
            rate_limiter,
            lock,
            sessions,
            verification,
            mfa,
            backup,
            trusted,
            login,
            cleanup,
        })
    }

    /// Connect to the configured Postgres and shared-store backends, run
    /// migrations, and wire the core.
    pub async fn connect(
        config: &CoreConfig,
        sender: Arc<dyn CodeSender>,
    ) -> Result<Self, CoreError> {
        let pool = db::create_pool(&config.database).await?;
        db::run_migrations(&pool)
            .await
            .map_err(|e| CoreError::Database(e.into()))?;

        let cache = Arc::new(
            HybridCache::new(
                config.cache.redis_url.as_deref(),
                config.cache.fallback_capacity,
            )
            .await,
        );
        let storage: Arc<dyn AuthStorage> = Arc::new(PgStorage::new(pool));

        Self::new(config, cache, storage, sender)
    }

    /// Current substrate mode; `DegradedLocal` means cross-instance
    /// guarantees are suspended.
    pub fn cache_mode(&self) -> CacheMode {
        self.cache.mode()
    }

    /// Health signal for boundary services. Degraded mode is not an outage,
    /// but callers may choose to fail closed on it.
    pub fn health_check(&self) -> Result<(), CoreError> {
        match self.cache_mode() {
            CacheMode::Distributed => Ok(()),
            CacheMode::DegradedLocal => Err(CoreError::StoreDegraded(
                "shared cache store unreachable, coordination is per-instance".to_string(),
            )),
        }
    }

    /// Start the periodic cleanup task.
    pub fn start_cleanup(&self) -> CleanupHandle {
        self.cleanup.clone().spawn()
    }

    /// Trigger a single cleanup sweep, outside the periodic schedule.
    pub async fn run_cleanup_once(&self) -> Result<services::CleanupSummary, CoreError> {
        self.cleanup.run_once().await
    }
}
