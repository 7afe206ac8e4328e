//! End-to-end login flows against the in-memory cache and storage backends.

use auth_core::cache::HybridCache;
use auth_core::config::{
    CacheConfig, CleanupConfig, CoreConfig, DatabaseConfig, Environment, MfaConfig,
    RateLimitConfig, SessionConfig,
};
use auth_core::models::{ClientContext, MfaMethod};
use auth_core::services::{
    EnrollmentRequest, LoggingCodeSender, LoginGate, LoginProof, SessionMetadata,
    TrustPresentation,
};
use auth_core::storage::{AuthStorage, MemoryStorage};
use auth_core::{AuthSecurityCore, CoreError};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

fn test_config() -> CoreConfig {
    CoreConfig {
        environment: Environment::Dev,
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 5,
            min_connections: 1,
        },
        cache: CacheConfig {
            redis_url: None,
            default_ttl_seconds: 3600,
            fallback_capacity: 1000,
        },
        session: SessionConfig {
            session_ttl_seconds: 604_800,
            refresh_ttl_seconds: 2_592_000,
        },
        mfa: MfaConfig {
            totp_issuer: "journal-test".to_string(),
            secret_key_hex: "11".repeat(32),
            verification_code_ttl_seconds: 600,
            verification_code_length: 6,
            trust_ttl_days: 30,
            trust_sliding: true,
        },
        rate_limit: RateLimitConfig {
            login_ip_limit: 10,
            login_ip_window_seconds: 60,
            login_user_limit: 5,
            login_user_window_seconds: 300,
            mfa_verify_limit: 5,
            mfa_verify_window_seconds: 300,
            code_issue_limit: 10,
            code_issue_window_seconds: 900,
        },
        cleanup: CleanupConfig {
            interval_seconds: 300,
            attempt_retention_days: 30,
            code_grace_seconds: 3600,
        },
    }
}

struct Harness {
    core: AuthSecurityCore,
    storage: Arc<MemoryStorage>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("auth_core=info")
        .try_init();

    let storage = Arc::new(MemoryStorage::new());
    let core = AuthSecurityCore::new(
        &test_config(),
        Arc::new(HybridCache::local_only(1000)),
        storage.clone(),
        Arc::new(LoggingCodeSender),
    )
    .expect("core wiring");
    Harness { core, storage }
}

fn totp_code(secret_base32: &str) -> String {
    let bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .unwrap();
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        bytes,
        Some("journal-test".to_string()),
        "account".to_string(),
    )
    .unwrap();
    totp.generate_current().unwrap()
}

async fn enroll_totp(harness: &Harness, user: Uuid, ctx: &ClientContext) -> String {
    let enrollment = harness
        .core
        .mfa
        .enroll(
            user,
            MfaMethod::Totp,
            EnrollmentRequest {
                display_name: "Authenticator".to_string(),
                account_label: Some("user@example.com".to_string()),
                ..EnrollmentRequest::default()
            },
            ctx,
        )
        .await
        .unwrap();
    let secret = enrollment.totp.unwrap().secret_base32;
    assert!(harness
        .core
        .mfa
        .confirm_enrollment(user, enrollment.device_id, &totp_code(&secret), ctx)
        .await
        .unwrap());
    secret
}

#[tokio::test]
async fn credential_only_login_skips_mfa_entirely() {
    let harness = harness();
    let user = Uuid::new_v4();
    let ctx = ClientContext::new("203.0.113.7", "browser/1.0");

    harness
        .core
        .login
        .check_login_allowed(Some("203.0.113.7"), Some(user))
        .await
        .unwrap();

    let gate = harness
        .core
        .login
        .post_credential(user, SessionMetadata::default(), &ctx, None)
        .await
        .unwrap();
    let LoginGate::SessionIssued(session) = gate else {
        panic!("expected a session for an MFA-disabled user");
    };

    assert!(harness
        .core
        .sessions
        .get(&session.session_id)
        .await
        .unwrap()
        .is_some());

    // The attempt row carries no method: no MFA check was invoked.
    let attempts = harness
        .storage
        .attempts_for_user(user, Utc::now() - ChronoDuration::minutes(1))
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].success);
    assert!(attempts[0].method_code.is_none());
}

#[tokio::test]
async fn enrolled_user_must_verify_and_brute_force_is_cut_off() {
    let harness = harness();
    let user = Uuid::new_v4();
    let ctx = ClientContext::new("203.0.113.7", "browser/1.0");

    let secret = enroll_totp(&harness, user, &ctx).await;

    // The next login now demands a second factor.
    let gate = harness
        .core
        .login
        .post_credential(user, SessionMetadata::default(), &ctx, None)
        .await
        .unwrap();
    let LoginGate::MfaRequired(methods) = gate else {
        panic!("expected an MFA challenge after enrollment");
    };
    assert_eq!(methods, vec![MfaMethod::Totp]);

    // Five wrong codes inside the window...
    for _ in 0..5 {
        let outcome = harness
            .core
            .login
            .complete_mfa(
                user,
                LoginProof::Factor(MfaMethod::Totp, "000000".to_string()),
                SessionMetadata::default(),
                &ctx,
                None,
            )
            .await
            .unwrap();
        assert!(outcome.is_none());
    }

    // ...and the sixth attempt is refused no matter how correct it is.
    let denied = harness
        .core
        .login
        .complete_mfa(
            user,
            LoginProof::Factor(MfaMethod::Totp, totp_code(&secret)),
            SessionMetadata::default(),
            &ctx,
            None,
        )
        .await;
    assert!(matches!(denied, Err(CoreError::RateLimitExceeded { .. })));
}

#[tokio::test]
async fn trusted_device_skips_the_second_factor() {
    let harness = harness();
    let user = Uuid::new_v4();
    let ctx = ClientContext::new("203.0.113.7", "browser/1.0");

    let secret = enroll_totp(&harness, user, &ctx).await;

    // Completing MFA with a fingerprint also issues trust for the device.
    let login = harness
        .core
        .login
        .complete_mfa(
            user,
            LoginProof::Factor(MfaMethod::Totp, totp_code(&secret)),
            SessionMetadata::default(),
            &ctx,
            Some("fp-laptop"),
        )
        .await
        .unwrap()
        .expect("correct code completes the login");
    let trust_token = login.trust_token.expect("trust was requested");

    // A later login from the same device goes straight to a session.
    let gate = harness
        .core
        .login
        .post_credential(
            user,
            SessionMetadata::default(),
            &ctx,
            Some(&TrustPresentation {
                fingerprint: "fp-laptop".to_string(),
                token: trust_token.clone(),
            }),
        )
        .await
        .unwrap();
    assert!(matches!(gate, LoginGate::SessionIssued(_)));

    // A wrong token falls back to the full challenge instead of failing.
    let gate = harness
        .core
        .login
        .post_credential(
            user,
            SessionMetadata::default(),
            &ctx,
            Some(&TrustPresentation {
                fingerprint: "fp-laptop".to_string(),
                token: "tampered".to_string(),
            }),
        )
        .await
        .unwrap();
    assert!(matches!(gate, LoginGate::MfaRequired(_)));
}

#[tokio::test]
async fn backup_code_completes_a_login_once() {
    let harness = harness();
    let user = Uuid::new_v4();
    let ctx = ClientContext::new("203.0.113.7", "browser/1.0");

    enroll_totp(&harness, user, &ctx).await;
    let codes = harness.core.backup.generate(user, &ctx).await.unwrap();

    let first = harness
        .core
        .login
        .complete_mfa(
            user,
            LoginProof::BackupCode(codes[0].clone()),
            SessionMetadata::default(),
            &ctx,
            None,
        )
        .await
        .unwrap();
    assert!(first.is_some());

    // The same code is spent now.
    let replay = harness
        .core
        .login
        .complete_mfa(
            user,
            LoginProof::BackupCode(codes[0].clone()),
            SessionMetadata::default(),
            &ctx,
            None,
        )
        .await
        .unwrap();
    assert!(replay.is_none());
}

#[tokio::test]
async fn logout_everywhere_invalidates_every_session() {
    let harness = harness();
    let user = Uuid::new_v4();
    let ctx = ClientContext::new("203.0.113.7", "browser/1.0");

    let mut session_ids = Vec::new();
    for _ in 0..3 {
        let gate = harness
            .core
            .login
            .post_credential(user, SessionMetadata::default(), &ctx, None)
            .await
            .unwrap();
        let LoginGate::SessionIssued(session) = gate else {
            panic!("expected a session");
        };
        session_ids.push(session.session_id);
    }

    let removed = harness
        .core
        .login
        .logout_everywhere(user, &ctx)
        .await
        .unwrap();
    assert_eq!(removed, 3);

    for id in session_ids {
        assert!(harness.core.sessions.get(&id).await.unwrap().is_none());
    }
    assert!(harness
        .core
        .sessions
        .list_for_user(user)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn repeated_logins_hit_the_per_user_limit() {
    let harness = harness();
    let user = Uuid::new_v4();

    for _ in 0..5 {
        harness
            .core
            .login
            .check_login_allowed(None, Some(user))
            .await
            .unwrap();
    }
    let denied = harness.core.login.check_login_allowed(None, Some(user)).await;
    assert!(matches!(denied, Err(CoreError::RateLimitExceeded { .. })));
}

#[tokio::test]
async fn cleanup_sweep_runs_and_reports() {
    let harness = harness();
    let summary = harness.core.run_cleanup_once().await.unwrap();
    assert_eq!(summary.verification_codes_removed, 0);
    assert_eq!(summary.attempts_removed, 0);
    assert_eq!(summary.trusted_devices_removed, 0);
}
