//! Ephemeral session store backed by Redis key TTLs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::cache::RedisPool;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::SessionResult;
use crate::models::Session;

/// Keys fetched per MGET when listing every entry
const LIST_BATCH: usize = 500;

/// TTL-expiring key-value store of live sessions
///
/// The backend may drop an entry at any time at or after its `expires_at`;
/// callers must never assume an entry they wrote is still present.
#[async_trait]
pub trait EphemeralSessionStore: Send + Sync {
    /// Write the entry with a native time-to-live
    async fn put(&self, session: &Session, ttl: Duration) -> SessionResult<()>;

    /// Read an entry; expired entries read as absent even if not yet evicted
    async fn get(&self, session_id: &str) -> SessionResult<Option<Session>>;

    /// Remove an entry, returning whether one was present
    async fn delete(&self, session_id: &str) -> SessionResult<bool>;

    /// Whether a currently valid entry exists
    async fn exists(&self, session_id: &str) -> SessionResult<bool>;

    /// Every entry still physically present, expired or not
    ///
    /// Walks the whole store; reconciliation only.
    async fn list_all(&self) -> SessionResult<Vec<Session>>;

    /// Currently valid entries belonging to one user
    async fn list_for_user(&self, user_id: Uuid) -> SessionResult<Vec<Session>>;

    async fn health_check(&self) -> SessionResult<bool>;
}

/// Key holding one JSON-encoded session
pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Set of session ids belonging to one user
pub fn user_index_key(user_id: Uuid) -> String {
    format!("user_sessions:{}", user_id)
}

/// Redis implementation of [`EphemeralSessionStore`]
#[derive(Clone)]
pub struct RedisSessionStore {
    redis_pool: RedisPool,
    clock: Arc<dyn Clock>,
}

impl RedisSessionStore {
    pub fn new(redis_pool: RedisPool, clock: Arc<dyn Clock>) -> Self {
        Self { redis_pool, clock }
    }

    /// Read and decode without applying the expiry check
    async fn get_raw(&self, session_id: &str) -> SessionResult<Option<Session>> {
        let value = self.redis_pool.get(&session_key(session_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Decode MGET results, skipping (and reporting) gaps and corrupt entries
    fn decode_all(keys: &[String], values: Vec<Option<String>>) -> (Vec<Session>, Vec<String>) {
        let mut sessions = Vec::with_capacity(values.len());
        let mut missing = Vec::new();

        for (key, value) in keys.iter().zip(values) {
            match value {
                Some(json) => match serde_json::from_str::<Session>(&json) {
                    Ok(session) => sessions.push(session),
                    Err(e) => warn!(key = %key, "Skipping undecodable session entry: {}", e),
                },
                None => missing.push(key.clone()),
            }
        }

        (sessions, missing)
    }
}

#[async_trait]
impl EphemeralSessionStore for RedisSessionStore {
    async fn put(&self, session: &Session, ttl: Duration) -> SessionResult<()> {
        let ttl_secs = ttl.as_secs().max(1);
        let json = serde_json::to_string(session)?;

        self.redis_pool
            .set(&session_key(&session.session_id), &json, Some(ttl_secs))
            .await?;
        self.redis_pool
            .sadd_with_expiry(&user_index_key(session.user_id), &session.session_id, ttl_secs)
            .await?;

        debug!(session_id = %session.session_id, ttl_secs, "Stored session in Redis");
        Ok(())
    }

    async fn get(&self, session_id: &str) -> SessionResult<Option<Session>> {
        let now = self.clock.now();
        Ok(self
            .get_raw(session_id)
            .await?
            .filter(|session| !session.is_expired_at(now)))
    }

    async fn delete(&self, session_id: &str) -> SessionResult<bool> {
        // The owner is needed to keep the per-user index tidy
        let owner = match self.get_raw(session_id).await {
            Ok(session) => session.map(|s| s.user_id),
            Err(e) => {
                warn!(session_id = %session_id, "Could not read session before delete: {}", e);
                None
            }
        };

        let removed = self.redis_pool.delete(&session_key(session_id)).await?;
        if let Some(user_id) = owner {
            self.redis_pool
                .srem(&user_index_key(user_id), session_id)
                .await?;
        }

        Ok(removed)
    }

    async fn exists(&self, session_id: &str) -> SessionResult<bool> {
        Ok(self.get(session_id).await?.is_some())
    }

    async fn list_all(&self) -> SessionResult<Vec<Session>> {
        let keys = self.redis_pool.scan_keys(&session_key("*")).await?;

        let mut sessions = Vec::with_capacity(keys.len());
        for batch in keys.chunks(LIST_BATCH) {
            let values = self.redis_pool.mget(batch).await?;
            // Keys evicted between SCAN and MGET are simply gone
            let (decoded, _) = Self::decode_all(batch, values);
            sessions.extend(decoded);
        }
        debug!(listed = sessions.len(), "Listed session entries");
        Ok(sessions)
    }

    async fn list_for_user(&self, user_id: Uuid) -> SessionResult<Vec<Session>> {
        let index_key = user_index_key(user_id);
        let ids = self.redis_pool.smembers(&index_key).await?;
        let keys: Vec<String> = ids.iter().map(|id| session_key(id)).collect();
        let values = self.redis_pool.mget(&keys).await?;

        let (sessions, missing) = Self::decode_all(&keys, values);

        // Prune index members whose entry the TTL already removed
        for (id, key) in ids.iter().zip(&keys) {
            if missing.contains(key) {
                if let Err(e) = self.redis_pool.srem(&index_key, id).await {
                    debug!(session_id = %id, "Failed to prune user index: {}", e);
                }
            }
        }

        let now = self.clock.now();
        Ok(sessions
            .into_iter()
            .filter(|s| s.user_id == user_id && !s.is_expired_at(now))
            .collect())
    }

    async fn health_check(&self) -> SessionResult<bool> {
        Ok(self.redis_pool.health_check().await?)
    }
}
