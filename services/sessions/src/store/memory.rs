//! In-process implementations of both session stores
//!
//! The ephemeral store evicts lazily: an expired entry stays physically
//! present (visible to `list_all`) until [`MemoryEphemeralStore::evict_expired`]
//! runs, the way a TTL backend lags behind `expires_at`. Both stores accept
//! injected faults so per-row and per-pass failure handling can be exercised.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::ephemeral::EphemeralSessionStore;
use super::record::SessionRecordStore;
use crate::clock::Clock;
use crate::error::{SessionError, SessionResult};
use crate::models::{EndReason, Session, SessionMetadata, SessionWindow, Transition};

/// Failures to inject into a store
#[derive(Debug, Default)]
struct Faults {
    /// Fail every operation
    unavailable: bool,
    /// Fail per-session operations on these ids
    sessions: HashSet<String>,
    /// Added to every operation
    latency: Option<Duration>,
}

impl Faults {
    async fn check(faults: &RwLock<Faults>, session_id: Option<&str>) -> SessionResult<()> {
        let (unavailable, failing, latency) = {
            let faults = faults.read().await;
            let failing = session_id.is_some_and(|id| faults.sessions.contains(id));
            (faults.unavailable, failing, faults.latency)
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if unavailable {
            return Err(SessionError::StoreUnavailable("injected outage".to_string()));
        }
        if failing {
            return Err(SessionError::StoreUnavailable(format!(
                "injected failure for {}",
                session_id.unwrap_or_default()
            )));
        }
        Ok(())
    }
}

macro_rules! fault_controls {
    () => {
        /// Make every operation fail with `StoreUnavailable`
        pub async fn set_unavailable(&self, unavailable: bool) {
            self.faults.write().await.unavailable = unavailable;
        }

        /// Make operations on one session id fail with `StoreUnavailable`
        pub async fn fail_session(&self, session_id: &str) {
            self.faults.write().await.sessions.insert(session_id.to_string());
        }

        pub async fn heal_session(&self, session_id: &str) {
            self.faults.write().await.sessions.remove(session_id);
        }

        /// Delay every operation
        pub async fn set_latency(&self, latency: Option<Duration>) {
            self.faults.write().await.latency = latency;
        }
    };
}

/// In-memory [`EphemeralSessionStore`]
pub struct MemoryEphemeralStore {
    entries: RwLock<HashMap<String, Session>>,
    faults: RwLock<Faults>,
    /// Writes on these ids land but report a failure
    unacknowledged: RwLock<HashSet<String>>,
    clock: Arc<dyn Clock>,
}

impl MemoryEphemeralStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
            unacknowledged: RwLock::new(HashSet::new()),
            clock,
        }
    }

    fault_controls!();

    /// Make `put` on one session id store the entry and still fail, like a
    /// write whose reply timed out
    pub async fn fail_after_write(&self, session_id: &str) {
        self.unacknowledged
            .write()
            .await
            .insert(session_id.to_string());
    }

    /// Drop every entry past its expiry, as the backend's TTL eventually does
    pub async fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, session| !session.is_expired_at(now));
        before - entries.len()
    }

    /// Drop an entry out from under the application (cache eviction, flush)
    pub async fn evict(&self, session_id: &str) -> bool {
        self.entries.write().await.remove(session_id).is_some()
    }

    /// Physically present entries, expired or not
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl EphemeralSessionStore for MemoryEphemeralStore {
    async fn put(&self, session: &Session, _ttl: Duration) -> SessionResult<()> {
        Faults::check(&self.faults, Some(&session.session_id)).await?;
        self.entries
            .write()
            .await
            .insert(session.session_id.clone(), session.clone());

        if self.unacknowledged.read().await.contains(&session.session_id) {
            return Err(SessionError::StoreUnavailable(format!(
                "no reply for write of {}",
                session.session_id
            )));
        }
        Ok(())
    }

    async fn get(&self, session_id: &str) -> SessionResult<Option<Session>> {
        Faults::check(&self.faults, Some(session_id)).await?;
        let now = self.clock.now();
        Ok(self
            .entries
            .read()
            .await
            .get(session_id)
            .filter(|session| !session.is_expired_at(now))
            .cloned())
    }

    async fn delete(&self, session_id: &str) -> SessionResult<bool> {
        Faults::check(&self.faults, Some(session_id)).await?;
        Ok(self.entries.write().await.remove(session_id).is_some())
    }

    async fn exists(&self, session_id: &str) -> SessionResult<bool> {
        Ok(self.get(session_id).await?.is_some())
    }

    async fn list_all(&self) -> SessionResult<Vec<Session>> {
        Faults::check(&self.faults, None).await?;
        let mut sessions: Vec<Session> = self.entries.read().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn list_for_user(&self, user_id: Uuid) -> SessionResult<Vec<Session>> {
        Faults::check(&self.faults, None).await?;
        let now = self.clock.now();
        let mut sessions: Vec<Session> = self
            .entries
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id && !s.is_expired_at(now))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    async fn health_check(&self) -> SessionResult<bool> {
        Ok(Faults::check(&self.faults, None).await.is_ok())
    }
}

/// In-memory [`SessionRecordStore`]
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: RwLock<HashMap<String, SessionMetadata>>,
    faults: RwLock<Faults>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fault_controls!();

    /// Insert or replace a row without any checks (test fixtures)
    pub async fn insert_raw(&self, metadata: SessionMetadata) {
        self.rows
            .write()
            .await
            .insert(metadata.session_id.clone(), metadata);
    }

    /// Every row ordered by session id
    pub async fn snapshot(&self) -> Vec<SessionMetadata> {
        let mut rows: Vec<SessionMetadata> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        rows
    }

    async fn select<F>(&self, predicate: F) -> Vec<SessionMetadata>
    where
        F: Fn(&SessionMetadata) -> bool,
    {
        self.rows
            .read()
            .await
            .values()
            .filter(|row| predicate(row))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionRecordStore for MemoryRecordStore {
    async fn create(&self, metadata: &SessionMetadata) -> SessionResult<()> {
        Faults::check(&self.faults, Some(&metadata.session_id)).await?;
        let mut rows = self.rows.write().await;
        if rows.contains_key(&metadata.session_id) {
            return Err(SessionError::Conflict(metadata.session_id.clone()));
        }
        rows.insert(metadata.session_id.clone(), metadata.clone());
        Ok(())
    }

    async fn find_by_session_id(&self, session_id: &str) -> SessionResult<Option<SessionMetadata>> {
        Faults::check(&self.faults, Some(session_id)).await?;
        Ok(self.rows.read().await.get(session_id).cloned())
    }

    async fn find_inactive_since(
        &self,
        threshold: DateTime<Utc>,
    ) -> SessionResult<Vec<SessionMetadata>> {
        Faults::check(&self.faults, None).await?;
        let mut rows = self
            .select(|row| row.is_active() && row.last_activity_at < threshold)
            .await;
        rows.sort_by_key(|row| row.last_activity_at);
        Ok(rows)
    }

    async fn find_active_in_window(
        &self,
        window: SessionWindow,
    ) -> SessionResult<Vec<SessionMetadata>> {
        Faults::check(&self.faults, None).await?;
        let mut rows = self
            .select(|row| row.is_active() && window.contains(row.started_at))
            .await;
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows)
    }

    async fn end_session(
        &self,
        session_id: &str,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> SessionResult<Transition> {
        Faults::check(&self.faults, Some(session_id)).await?;
        Ok(match self.rows.write().await.get_mut(session_id) {
            Some(row) => row.end(reason, ended_at),
            None => Transition::Missing,
        })
    }

    async fn delete_ended_before(&self, threshold: DateTime<Utc>) -> SessionResult<u64> {
        Faults::check(&self.faults, None).await?;
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| {
            let expired = row.status.is_terminal() && row.ended_at.is_some_and(|at| at < threshold);
            !expired
        });
        Ok((before - rows.len()) as u64)
    }

    async fn count_active_for_user(&self, user_id: Uuid) -> SessionResult<u64> {
        Faults::check(&self.faults, None).await?;
        Ok(self
            .select(|row| row.user_id == user_id && row.is_active())
            .await
            .len() as u64)
    }

    async fn find_active_for_user(&self, user_id: Uuid) -> SessionResult<Vec<SessionMetadata>> {
        Faults::check(&self.faults, None).await?;
        let mut rows = self
            .select(|row| row.user_id == user_id && row.is_active())
            .await;
        rows.sort_by_key(|row| row.started_at);
        Ok(rows)
    }

    async fn find_for_user_in_window(
        &self,
        user_id: Uuid,
        window: SessionWindow,
    ) -> SessionResult<Vec<SessionMetadata>> {
        Faults::check(&self.faults, None).await?;
        let mut rows = self
            .select(|row| row.user_id == user_id && window.contains(row.started_at))
            .await;
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(rows)
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> SessionResult<bool> {
        Faults::check(&self.faults, Some(session_id)).await?;
        Ok(self
            .rows
            .write()
            .await
            .get_mut(session_id)
            .is_some_and(|row| row.touch(at)))
    }

    async fn health_check(&self) -> SessionResult<bool> {
        Ok(Faults::check(&self.faults, None).await.is_ok())
    }
}
