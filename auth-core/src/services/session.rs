//! Session store with a per-user secondary index for bulk invalidation.
//!
//! Session identifiers come from the CSPRNG and are never derived from user
//! attributes. The index at `user:{id}:sessions` is maintained through CAS
//! loops so "log out everywhere" never needs a scan and a concurrent reader
//! never observes a dangling index entry for longer than one cache
//! operation.

use crate::cache::CacheStore;
use crate::error::CoreError;
use crate::utils::codes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Bounded retries for index CAS loops before reporting contention.
const INDEX_CAS_RETRIES: usize = 8;

/// Closed metadata set attached to a session at creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Minimal display data surfaced through the non-protected cookie.
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub user_id: Uuid,
    /// Opaque grant for the refresh flow owned by the boundary service.
    pub refresh_token: String,
    pub metadata: SessionMetadata,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Cookie issuance descriptor consumed by the web collaborator. The core
/// never persists cookies.
#[derive(Debug, Clone)]
pub struct CookieSpec {
    pub name: &'static str,
    pub value: String,
    pub http_only: bool,
    pub path: &'static str,
    pub max_age: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionCookies {
    pub access: CookieSpec,
    pub refresh: CookieSpec,
    pub display: CookieSpec,
}

#[derive(Clone)]
pub struct SessionStore {
    cache: Arc<dyn CacheStore>,
    session_ttl: Duration,
    refresh_ttl: Duration,
}

impl SessionStore {
    pub fn new(cache: Arc<dyn CacheStore>, session_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            cache,
            session_ttl,
            refresh_ttl,
        }
    }

    fn session_key(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    fn index_key(user_id: Uuid) -> String {
        format!("user:{}:sessions", user_id)
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        metadata: SessionMetadata,
    ) -> Result<Session, CoreError> {
        let now = Utc::now();
        let session = Session {
            session_id: codes::generate_token(32),
            user_id,
            refresh_token: codes::generate_token(32),
            metadata,
            created_at: now,
            expires_at: now
                + chrono::Duration::seconds(self.session_ttl.as_secs().min(i64::MAX as u64) as i64),
        };

        let payload = serde_json::to_string(&session)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        self.cache
            .set(&Self::session_key(&session.session_id), &payload, self.session_ttl)
            .await?;
        self.index_insert(user_id, &session.session_id).await?;

        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        let raw = self.cache.get(&Self::session_key(session_id)).await?;
        Ok(raw.and_then(|payload| match serde_json::from_str(&payload) {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding undecodable session record");
                None
            }
        }))
    }

    /// Extend the idle lifetime of a live session.
    pub async fn touch(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        let Some(mut session) = self.get(session_id).await? else {
            return Ok(None);
        };

        session.expires_at = Utc::now()
            + chrono::Duration::seconds(self.session_ttl.as_secs().min(i64::MAX as u64) as i64);
        let payload = serde_json::to_string(&session)
            .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
        self.cache
            .set(&Self::session_key(session_id), &payload, self.session_ttl)
            .await?;
        Ok(Some(session))
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), CoreError> {
        let session = self.get(session_id).await?;
        self.cache.delete(&Self::session_key(session_id)).await?;
        if let Some(session) = session {
            self.index_remove(session.user_id, session_id).await?;
        }
        Ok(())
    }

    /// Live sessions for a user, pruned of ids whose record already expired.
    pub async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Session>, CoreError> {
        let ids = self.index_read(user_id).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.get(&id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Remove every session of a user plus the index entry. Returns the
    /// number of session records deleted.
    pub async fn delete_all_for_user(&self, user_id: Uuid) -> Result<u64, CoreError> {
        let index_key = Self::index_key(user_id);
        let mut removed: u64 = 0;

        for _ in 0..INDEX_CAS_RETRIES {
            let Some(raw) = self.cache.get(&index_key).await? else {
                return Ok(removed);
            };
            let ids: Vec<String> = serde_json::from_str(&raw).unwrap_or_default();

            for id in &ids {
                self.cache.delete(&Self::session_key(id)).await?;
            }
            removed += ids.len() as u64;

            // Only drop the index if nobody added a session meanwhile;
            // otherwise loop and take the newcomers out as well.
            if self.cache.compare_and_delete(&index_key, &raw).await? {
                return Ok(removed);
            }
        }

        self.cache.delete(&index_key).await?;
        Ok(removed)
    }

    /// Cookie descriptors for a freshly issued session: two HttpOnly token
    /// cookies plus a readable one carrying minimal display data.
    pub fn cookies(&self, session: &Session) -> SessionCookies {
        SessionCookies {
            access: CookieSpec {
                name: "auth_session",
                value: session.session_id.clone(),
                http_only: true,
                path: "/",
                max_age: self.session_ttl,
            },
            refresh: CookieSpec {
                name: "auth_refresh",
                value: session.refresh_token.clone(),
                http_only: true,
                path: "/",
                max_age: self.refresh_ttl,
            },
            display: CookieSpec {
                name: "auth_display",
                value: session.metadata.display_name.clone().unwrap_or_default(),
                http_only: false,
                path: "/",
                max_age: self.session_ttl,
            },
        }
    }

    async fn index_read(&self, user_id: Uuid) -> Result<Vec<String>, CoreError> {
        let raw = self.cache.get(&Self::index_key(user_id)).await?;
        Ok(raw
            .map(|payload| serde_json::from_str(&payload).unwrap_or_default())
            .unwrap_or_default())
    }

    async fn index_insert(&self, user_id: Uuid, session_id: &str) -> Result<(), CoreError> {
        let key = Self::index_key(user_id);

        for _ in 0..INDEX_CAS_RETRIES {
            let current = self.cache.get(&key).await?;
            let mut ids: Vec<String> = current
                .as_deref()
                .map(|raw| serde_json::from_str(raw).unwrap_or_default())
                .unwrap_or_default();

            if !ids.iter().any(|id| id == session_id) {
                ids.push(session_id.to_string());
            }
            let updated =
                serde_json::to_string(&ids).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;

            if self
                .cache
                .compare_and_set(&key, current.as_deref(), &updated, self.refresh_ttl)
                .await?
            {
                return Ok(());
            }
        }

        Err(CoreError::Cache(anyhow::anyhow!(
            "session index contention for user {}",
            user_id
        )))
    }

    async fn index_remove(&self, user_id: Uuid, session_id: &str) -> Result<(), CoreError> {
        let key = Self::index_key(user_id);

        for _ in 0..INDEX_CAS_RETRIES {
            let Some(current) = self.cache.get(&key).await? else {
                return Ok(());
            };
            let mut ids: Vec<String> = serde_json::from_str(&current).unwrap_or_default();
            ids.retain(|id| id != session_id);

            let updated =
                serde_json::to_string(&ids).map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;
            if self
                .cache
                .compare_and_set(&key, Some(&current), &updated, self.refresh_ttl)
                .await?
            {
                return Ok(());
            }
        }

        Err(CoreError::Cache(anyhow::anyhow!(
            "session index contention for user {}",
            user_id
        )))
    }
}
