//! Session lifecycle operations over the ephemeral and durable stores

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{SessionError, SessionResult};
use crate::limiter::SessionLimiter;
use crate::models::{EndReason, NewSession, Session, SessionMetadata, SessionWindow, Transition};
use crate::store::{EphemeralSessionStore, SessionRecordStore, with_timeout};

/// Reachability of both stores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    pub redis: bool,
    pub postgres: bool,
}

impl StoreHealth {
    pub fn is_healthy(&self) -> bool {
        self.redis && self.postgres
    }
}

/// Session manager for creating, terminating and querying user sessions
#[derive(Clone)]
pub struct SessionManager {
    ephemeral: Arc<dyn EphemeralSessionStore>,
    records: Arc<dyn SessionRecordStore>,
    limiter: SessionLimiter,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
}

impl SessionManager {
    /// Create a new session manager
    pub fn new(
        ephemeral: Arc<dyn EphemeralSessionStore>,
        records: Arc<dyn SessionRecordStore>,
        limiter: SessionLimiter,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            ephemeral,
            records,
            limiter,
            clock,
            store_timeout,
        }
    }

    /// Current instant as seen by the stores
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> SessionResult<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        with_timeout(self.store_timeout, operation, call).await
    }

    /// Create a session from an authentication payload stamped with the current time
    pub async fn create_session(&self, new_session: NewSession) -> SessionResult<Session> {
        let (session, metadata) = new_session.into_parts(self.clock.now());
        self.create(session, metadata).await
    }

    /// Admit and store a session pair
    ///
    /// The ephemeral write is the admission signal. Admissions for one user
    /// are serialized from the capacity check through both writes. A durable
    /// row whose ephemeral write then fails is ended immediately as
    /// `AdmissionFailed`, and the entry is deleted in case the write landed.
    /// A durable write that fails transiently is tolerated; the cross-store
    /// sync backfills the missing row.
    pub async fn create(&self, session: Session, metadata: SessionMetadata) -> SessionResult<Session> {
        if session.session_id.is_empty() {
            return Err(SessionError::InvalidInput("session id must not be empty".to_string()));
        }
        if session.session_id != metadata.session_id || session.user_id != metadata.user_id {
            return Err(SessionError::InvalidInput(
                "session and metadata must share session id and user id".to_string(),
            ));
        }
        if !metadata.is_active() {
            return Err(SessionError::InvalidInput(format!(
                "new session metadata must be ACTIVE, got {}",
                metadata.status
            )));
        }

        let now = self.clock.now();
        let ttl = session
            .remaining_ttl(now)
            .and_then(|ttl| ttl.to_std().ok())
            .ok_or_else(|| {
                SessionError::InvalidInput(format!(
                    "session {} already expired at {}",
                    session.session_id, session.expires_at
                ))
            })?;

        let _permit = self.limiter.admit(session.user_id).await?;

        let durable = match self.call("create", self.records.create(&metadata)).await {
            Ok(()) => true,
            Err(SessionError::StoreUnavailable(e)) => {
                warn!(
                    session_id = %session.session_id,
                    "Session metadata not recorded, continuing without it: {}", e
                );
                false
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = self.call("put", self.ephemeral.put(&session, ttl)).await {
            error!(session_id = %session.session_id, "Failed to store session: {}", e);
            // A timed out write may still have landed
            if let Err(e) = self
                .call("delete", self.ephemeral.delete(&session.session_id))
                .await
            {
                warn!(
                    session_id = %session.session_id,
                    "Failed to remove unacknowledged session entry: {}", e
                );
            }
            if durable {
                self.end_record(&session.session_id, EndReason::AdmissionFailed, now)
                    .await;
            }
            return Err(e);
        }

        info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            expires_at = %session.expires_at,
            "Created session"
        );
        Ok(session)
    }

    /// Terminate one session on explicit logout
    ///
    /// Fails with `NotFound` only when neither store knows the session.
    pub async fn logout(&self, session_id: &str) -> SessionResult<()> {
        info!(session_id = %session_id, "Logging out session");

        let removed = self.call("delete", self.ephemeral.delete(session_id)).await?;
        let transition = self
            .call(
                "end_session",
                self.records
                    .end_session(session_id, EndReason::UserLogout, self.clock.now()),
            )
            .await?;

        if !removed && transition == Transition::Missing {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        debug!(session_id = %session_id, removed, ?transition, "Logout complete");
        Ok(())
    }

    /// Terminate every session of a user (logout from all devices)
    pub async fn revoke_all_sessions(&self, user_id: Uuid) -> SessionResult<u64> {
        info!(user_id = %user_id, "Revoking all sessions");
        self.revoke_matching(user_id, EndReason::SecurityEvent, |_| true)
            .await
    }

    /// Terminate every session a user opened from one device
    pub async fn revoke_device_sessions(&self, user_id: Uuid, device_id: &str) -> SessionResult<u64> {
        info!(user_id = %user_id, device_id = %device_id, "Revoking device sessions");
        self.revoke_matching(user_id, EndReason::DeviceRevoked, |device| {
            device == Some(device_id)
        })
        .await
    }

    /// Revoke the union of live entries and ACTIVE rows whose device matches
    ///
    /// Every candidate is attempted; any failure is reported after the rest
    /// have been processed.
    async fn revoke_matching<P>(&self, user_id: Uuid, reason: EndReason, matches: P) -> SessionResult<u64>
    where
        P: Fn(Option<&str>) -> bool,
    {
        let live = self
            .call("list_for_user", self.ephemeral.list_for_user(user_id))
            .await?;
        let rows = self
            .call("find_active_for_user", self.records.find_active_for_user(user_id))
            .await?;

        let ids: BTreeSet<String> = live
            .into_iter()
            .filter(|s| matches(s.device.device_id.as_deref()))
            .map(|s| s.session_id)
            .chain(
                rows.into_iter()
                    .filter(|m| matches(m.device.device_id.as_deref()))
                    .map(|m| m.session_id),
            )
            .collect();

        let now = self.clock.now();
        let mut revoked = 0u64;
        let mut failed = 0u64;

        for session_id in &ids {
            let removed = self.call("delete", self.ephemeral.delete(session_id)).await;
            let ended = self
                .call("end_session", self.records.end_session(session_id, reason, now))
                .await;

            match (removed, ended) {
                (Ok(_), Ok(_)) => revoked += 1,
                (removed, ended) => {
                    failed += 1;
                    error!(
                        session_id = %session_id,
                        ephemeral = ?removed.err(),
                        record = ?ended.err(),
                        "Failed to revoke session"
                    );
                }
            }
        }

        info!(user_id = %user_id, reason = %reason, revoked, failed, "Revoked sessions");

        if failed > 0 {
            return Err(SessionError::StoreUnavailable(format!(
                "{} of {} sessions could not be revoked",
                failed,
                ids.len()
            )));
        }
        Ok(revoked)
    }

    /// Record activity on a live session
    ///
    /// The ephemeral entry keeps its remaining lifetime; the durable
    /// `last_activity_at` is updated best-effort.
    pub async fn record_activity(&self, session_id: &str) -> SessionResult<Session> {
        let now = self.clock.now();
        let mut session = self
            .call("get", self.ephemeral.get(session_id))
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let ttl = session
            .remaining_ttl(now)
            .and_then(|ttl| ttl.to_std().ok())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        session.last_access_at = now;
        self.call("put", self.ephemeral.put(&session, ttl)).await?;

        if let Err(e) = self.call("touch", self.records.touch(session_id, now)).await {
            warn!(session_id = %session_id, "Failed to record activity in metadata: {}", e);
        }

        Ok(session)
    }

    /// Whether the session is currently valid (ephemeral store only)
    pub async fn is_session_valid(&self, session_id: &str) -> SessionResult<bool> {
        self.call("exists", self.ephemeral.exists(session_id)).await
    }

    /// Number of ACTIVE metadata rows for a user
    pub async fn get_active_session_count(&self, user_id: Uuid) -> SessionResult<u64> {
        self.call(
            "count_active_for_user",
            self.records.count_active_for_user(user_id),
        )
        .await
    }

    /// Metadata rows for a user started inside the window, newest first
    pub async fn get_session_history(
        &self,
        user_id: Uuid,
        window: SessionWindow,
    ) -> SessionResult<Vec<SessionMetadata>> {
        self.call(
            "find_for_user_in_window",
            self.records.find_for_user_in_window(user_id, window),
        )
        .await
    }

    /// Currently valid sessions of a user, oldest first
    pub async fn get_active_sessions(&self, user_id: Uuid) -> SessionResult<Vec<Session>> {
        let mut sessions = self
            .call("list_for_user", self.ephemeral.list_for_user(user_id))
            .await?;
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Get store health status; failures read as unhealthy
    pub async fn health_check(&self) -> StoreHealth {
        let redis = self
            .call("health_check", self.ephemeral.health_check())
            .await
            .unwrap_or(false);
        let postgres = self
            .call("health_check", self.records.health_check())
            .await
            .unwrap_or(false);

        StoreHealth { redis, postgres }
    }

    async fn end_record(&self, session_id: &str, reason: EndReason, at: DateTime<Utc>) {
        match self
            .call("end_session", self.records.end_session(session_id, reason, at))
            .await
        {
            Ok(transition) => {
                debug!(session_id = %session_id, reason = %reason, ?transition, "Ended session metadata")
            }
            Err(e) => error!(
                session_id = %session_id,
                reason = %reason,
                "Failed to end session metadata: {}", e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limiter::SessionLimiterConfig;
    use crate::models::{DeviceInfo, SessionStatus};
    use crate::store::{MemoryEphemeralStore, MemoryRecordStore};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        manager: SessionManager,
        ephemeral: Arc<MemoryEphemeralStore>,
        records: Arc<MemoryRecordStore>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let ephemeral = Arc::new(MemoryEphemeralStore::new(clock.clone()));
        let records = Arc::new(MemoryRecordStore::new());
        let limiter = SessionLimiter::new(
            SessionLimiterConfig {
                max_concurrent_sessions: 2,
                store_timeout: Duration::from_secs(1),
            },
            ephemeral.clone(),
            records.clone(),
        );
        let manager = SessionManager::new(
            ephemeral.clone(),
            records.clone(),
            limiter,
            clock.clone(),
            Duration::from_secs(1),
        );
        Fixture {
            manager,
            ephemeral,
            records,
            clock,
        }
    }

    fn payload(f: &Fixture, id: &str, user_id: Uuid, device_id: &str) -> NewSession {
        NewSession {
            session_id: id.to_string(),
            user_id,
            device: DeviceInfo {
                device_type: Some("IOS".to_string()),
                device_id: Some(device_id.to_string()),
                app_version: None,
            },
            permissions: vec![],
            expires_at: f.clock.now() + ChronoDuration::hours(1),
            ip_address: None,
            user_agent: None,
        }
    }

    async fn status(f: &Fixture, id: &str) -> SessionStatus {
        f.records
            .find_by_session_id(id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_create_writes_both_stores() {
        let f = fixture();
        let user = Uuid::new_v4();

        f.manager
            .create_session(payload(&f, "s-1", user, "phone"))
            .await
            .unwrap();

        assert!(f.manager.is_session_valid("s-1").await.unwrap());
        assert_eq!(f.manager.get_active_session_count(user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_expired_payloads() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.manager
            .create_session(payload(&f, "s-1", user, "phone"))
            .await
            .unwrap();

        assert!(matches!(
            f.manager.create_session(payload(&f, "s-1", user, "phone")).await,
            Err(SessionError::Conflict(_))
        ));

        let mut expired = payload(&f, "s-2", user, "phone");
        expired.expires_at = f.clock.now();
        assert!(matches!(
            f.manager.create_session(expired).await,
            Err(SessionError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_create_ends_row_when_ephemeral_write_fails() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.ephemeral.fail_session("s-1").await;

        assert!(matches!(
            f.manager.create_session(payload(&f, "s-1", user, "phone")).await,
            Err(SessionError::StoreUnavailable(_))
        ));

        let row = f.records.find_by_session_id("s-1").await.unwrap().unwrap();
        assert_eq!(row.status, SessionStatus::Revoked);
        assert_eq!(row.end_reason.as_deref(), Some("ADMISSION_FAILED"));
        assert_eq!(f.manager.get_active_session_count(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_tolerates_durable_write_failure() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.records.fail_session("s-1").await;

        f.manager
            .create_session(payload(&f, "s-1", user, "phone"))
            .await
            .unwrap();

        assert!(f.manager.is_session_valid("s-1").await.unwrap());
        f.records.heal_session("s-1").await;
        // Missing until the cross-store sync backfills it
        assert!(f.records.find_by_session_id("s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_removes_entry_when_put_is_not_acknowledged() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.ephemeral.fail_after_write("s-1").await;

        assert!(f
            .manager
            .create_session(payload(&f, "s-1", user, "phone"))
            .await
            .is_err());

        assert!(!f.manager.is_session_valid("s-1").await.unwrap());
        assert_eq!(status(&f, "s-1").await, SessionStatus::Revoked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_respect_the_limit() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.records.set_latency(Some(Duration::from_millis(50))).await;

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let manager = f.manager.clone();
                let new_session = payload(&f, &format!("s-{}", i), user, "phone");
                tokio::spawn(async move { manager.create_session(new_session).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(SessionError::CapacityExceeded { .. }) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }

        f.records.set_latency(None).await;
        assert_eq!(admitted, 2);
        assert_eq!(f.manager.get_active_session_count(user).await.unwrap(), 2);
        assert_eq!(f.manager.get_active_sessions(user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_logout_is_idempotent_and_reports_unknown_sessions() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.manager
            .create_session(payload(&f, "s-1", user, "phone"))
            .await
            .unwrap();

        f.manager.logout("s-1").await.unwrap();
        assert!(!f.manager.is_session_valid("s-1").await.unwrap());
        assert_eq!(status(&f, "s-1").await, SessionStatus::Revoked);

        // Already terminal, still known
        f.manager.logout("s-1").await.unwrap();

        assert!(f.manager.logout("unknown").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_revoke_device_sessions_spares_other_devices() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.manager
            .create_session(payload(&f, "s-phone", user, "phone"))
            .await
            .unwrap();
        f.manager
            .create_session(payload(&f, "s-laptop", user, "laptop"))
            .await
            .unwrap();

        let revoked = f.manager.revoke_device_sessions(user, "phone").await.unwrap();
        assert_eq!(revoked, 1);
        assert_eq!(status(&f, "s-phone").await, SessionStatus::Revoked);
        assert_eq!(status(&f, "s-laptop").await, SessionStatus::Active);
        assert!(f.manager.is_session_valid("s-laptop").await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_all_covers_rows_without_entries() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.manager
            .create_session(payload(&f, "a", user, "phone"))
            .await
            .unwrap();
        f.manager
            .create_session(payload(&f, "b", user, "laptop"))
            .await
            .unwrap();
        f.ephemeral.evict("b").await;

        assert_eq!(f.manager.revoke_all_sessions(user).await.unwrap(), 2);
        assert_eq!(f.manager.get_active_session_count(user).await.unwrap(), 0);
        assert!(f.manager.get_active_sessions(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_activity_touches_both_stores() {
        let f = fixture();
        let user = Uuid::new_v4();
        f.manager
            .create_session(payload(&f, "s-1", user, "phone"))
            .await
            .unwrap();

        f.clock.advance(ChronoDuration::minutes(10));
        let session = f.manager.record_activity("s-1").await.unwrap();
        assert_eq!(session.last_access_at, f.clock.now());

        let row = f.records.find_by_session_id("s-1").await.unwrap().unwrap();
        assert_eq!(row.last_activity_at, f.clock.now());

        f.clock.advance(ChronoDuration::hours(1));
        assert!(f.manager.record_activity("s-1").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_history_is_newest_first() {
        let f = fixture();
        let user = Uuid::new_v4();
        let start = f.clock.now();

        f.manager
            .create_session(payload(&f, "first", user, "phone"))
            .await
            .unwrap();
        f.manager.logout("first").await.unwrap();
        f.clock.advance(ChronoDuration::minutes(5));
        f.manager
            .create_session(payload(&f, "second", user, "phone"))
            .await
            .unwrap();

        let window = SessionWindow::new(start, f.clock.now()).unwrap();
        let ids: Vec<String> = f
            .manager
            .get_session_history(user, window)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.session_id)
            .collect();
        assert_eq!(ids, vec!["second".to_string(), "first".to_string()]);
    }

    #[tokio::test]
    async fn test_health_check_reports_each_store() {
        let f = fixture();
        assert!(f.manager.health_check().await.is_healthy());

        f.records.set_unavailable(true).await;
        let health = f.manager.health_check().await;
        assert!(health.redis);
        assert!(!health.postgres);
    }
}
