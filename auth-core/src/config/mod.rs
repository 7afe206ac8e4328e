use crate::error::CoreError;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    pub environment: Environment,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub mfa: MfaConfig,
    pub rate_limit: RateLimitConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Shared-store connection string. When absent the substrate starts in
    /// single-instance fallback mode.
    pub redis_url: Option<String>,
    pub default_ttl_seconds: u64,
    /// Capacity of the bounded in-process fallback store.
    pub fallback_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle lifetime of an access session (7 days default).
    pub session_ttl_seconds: u64,
    /// Lifetime of the refresh grant and of the per-user session index
    /// (30 days default).
    pub refresh_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MfaConfig {
    /// Label stamped into TOTP provisioning URIs.
    pub totp_issuer: String,
    /// 32-byte hex key for at-rest encryption of TOTP secrets.
    pub secret_key_hex: String,
    pub verification_code_ttl_seconds: u64,
    pub verification_code_length: usize,
    pub trust_ttl_days: i64,
    /// Extend trust expiry on each successful validation.
    pub trust_sliding: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_ip_limit: u32,
    pub login_ip_window_seconds: u64,
    pub login_user_limit: u32,
    pub login_user_window_seconds: u64,
    pub mfa_verify_limit: u32,
    pub mfa_verify_window_seconds: u64,
    pub code_issue_limit: u32,
    pub code_issue_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    pub interval_seconds: u64,
    pub attempt_retention_days: i64,
    /// Expired verification codes are kept this long before the sweeper
    /// removes them.
    pub code_grace_seconds: i64,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self, CoreError> {
        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| CoreError::Config(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = CoreConfig {
            environment,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            cache: CacheConfig {
                redis_url: env::var("REDIS_URL").ok(),
                default_ttl_seconds: parse_env("CACHE_DEFAULT_TTL_SECONDS", "3600", is_prod)?,
                fallback_capacity: parse_env("CACHE_FALLBACK_CAPACITY", "1000", is_prod)?,
            },
            session: SessionConfig {
                session_ttl_seconds: parse_env("SESSION_TTL_SECONDS", "604800", is_prod)?,
                refresh_ttl_seconds: parse_env("REFRESH_TTL_SECONDS", "2592000", is_prod)?,
            },
            mfa: MfaConfig {
                totp_issuer: get_env("MFA_TOTP_ISSUER", Some("auth-core"), is_prod)?,
                secret_key_hex: get_env("MFA_SECRET_KEY", None, is_prod)?,
                verification_code_ttl_seconds: parse_env(
                    "MFA_VERIFICATION_CODE_TTL_SECONDS",
                    "600",
                    is_prod,
                )?,
                verification_code_length: parse_env("MFA_VERIFICATION_CODE_LENGTH", "6", is_prod)?,
                trust_ttl_days: parse_env("MFA_TRUST_TTL_DAYS", "30", is_prod)?,
                trust_sliding: parse_env("MFA_TRUST_SLIDING", "true", is_prod)?,
            },
            rate_limit: RateLimitConfig {
                login_ip_limit: parse_env("RATE_LIMIT_LOGIN_IP_LIMIT", "10", is_prod)?,
                login_ip_window_seconds: parse_env(
                    "RATE_LIMIT_LOGIN_IP_WINDOW_SECONDS",
                    "60",
                    is_prod,
                )?,
                login_user_limit: parse_env("RATE_LIMIT_LOGIN_USER_LIMIT", "5", is_prod)?,
                login_user_window_seconds: parse_env(
                    "RATE_LIMIT_LOGIN_USER_WINDOW_SECONDS",
                    "300",
                    is_prod,
                )?,
                mfa_verify_limit: parse_env("RATE_LIMIT_MFA_VERIFY_LIMIT", "5", is_prod)?,
                mfa_verify_window_seconds: parse_env(
                    "RATE_LIMIT_MFA_VERIFY_WINDOW_SECONDS",
                    "300",
                    is_prod,
                )?,
                code_issue_limit: parse_env("RATE_LIMIT_CODE_ISSUE_LIMIT", "3", is_prod)?,
                code_issue_window_seconds: parse_env(
                    "RATE_LIMIT_CODE_ISSUE_WINDOW_SECONDS",
                    "900",
                    is_prod,
                )?,
            },
            cleanup: CleanupConfig {
                interval_seconds: parse_env("CLEANUP_INTERVAL_SECONDS", "300", is_prod)?,
                attempt_retention_days: parse_env("CLEANUP_ATTEMPT_RETENTION_DAYS", "30", is_prod)?,
                code_grace_seconds: parse_env("CLEANUP_CODE_GRACE_SECONDS", "3600", is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.cache.fallback_capacity == 0 {
            return Err(CoreError::Config(anyhow::anyhow!(
                "CACHE_FALLBACK_CAPACITY must be greater than 0"
            )));
        }

        if self.session.session_ttl_seconds == 0 {
            return Err(CoreError::Config(anyhow::anyhow!(
                "SESSION_TTL_SECONDS must be greater than 0"
            )));
        }

        if self.session.refresh_ttl_seconds < self.session.session_ttl_seconds {
            return Err(CoreError::Config(anyhow::anyhow!(
                "REFRESH_TTL_SECONDS must not be shorter than SESSION_TTL_SECONDS"
            )));
        }

        let key = hex::decode(&self.mfa.secret_key_hex)
            .map_err(|e| CoreError::Config(anyhow::anyhow!("MFA_SECRET_KEY is not hex: {}", e)))?;
        if key.len() != 32 {
            return Err(CoreError::Config(anyhow::anyhow!(
                "MFA_SECRET_KEY must decode to exactly 32 bytes"
            )));
        }

        if !(4..=10).contains(&self.mfa.verification_code_length) {
            return Err(CoreError::Config(anyhow::anyhow!(
                "MFA_VERIFICATION_CODE_LENGTH must be between 4 and 10"
            )));
        }

        if self.environment == Environment::Prod && self.cache.redis_url.is_none() {
            tracing::warn!(
                "No REDIS_URL configured in production; rate limits and locks are per-instance only"
            );
        }

        Ok(())
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_seconds)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session.session_ttl_seconds)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.session.refresh_ttl_seconds)
    }

    pub fn verification_code_ttl(&self) -> Duration {
        Duration::from_secs(self.mfa.verification_code_ttl_seconds)
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, CoreError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(CoreError::Config(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(CoreError::Config(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, CoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| CoreError::Config(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
