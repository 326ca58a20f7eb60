//! Concurrent session limiter

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::models::SessionMetadata;
use crate::store::{EphemeralSessionStore, SessionRecordStore, with_timeout};

/// Session limiter configuration
#[derive(Debug, Clone)]
pub struct SessionLimiterConfig {
    /// Maximum number of concurrent ACTIVE sessions per user
    pub max_concurrent_sessions: u32,
    /// Per-call store timeout
    pub store_timeout: Duration,
}

impl Default for SessionLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Proof of admission for one user
///
/// Admissions for the same user are serialized: the next `admit` for that
/// user waits until this permit is dropped. Hold it until the session has
/// been written to both stores.
#[derive(Debug)]
pub struct AdmissionPermit {
    _guard: OwnedMutexGuard<()>,
}

/// Admits new sessions while a user stays under the concurrency limit
///
/// The durable ACTIVE count is the fast path. Only when it reaches the limit
/// are the rows checked against the ephemeral store, so rows whose entry is
/// already gone (awaiting reconciliation) do not lock the user out. The
/// limiter never writes to either store; eviction is the caller's decision.
#[derive(Clone)]
pub struct SessionLimiter {
    config: SessionLimiterConfig,
    ephemeral: Arc<dyn EphemeralSessionStore>,
    records: Arc<dyn SessionRecordStore>,
    user_locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl SessionLimiter {
    /// Create a new session limiter
    pub fn new(
        config: SessionLimiterConfig,
        ephemeral: Arc<dyn EphemeralSessionStore>,
        records: Arc<dyn SessionRecordStore>,
    ) -> Self {
        Self {
            config,
            ephemeral,
            records,
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Wait for the admission lock of one user
    ///
    /// Locks nobody holds or waits on are dropped from the map here.
    async fn lock_user(&self, user_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.user_locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Check whether `user_id` may open one more session
    ///
    /// Fails with `CapacityExceeded` naming the oldest live session. On
    /// success the returned permit keeps other admissions for the same user
    /// waiting until it is dropped.
    pub async fn admit(&self, user_id: Uuid) -> SessionResult<AdmissionPermit> {
        let guard = self.lock_user(user_id).await;
        self.check_capacity(user_id).await?;
        Ok(AdmissionPermit { _guard: guard })
    }

    async fn check_capacity(&self, user_id: Uuid) -> SessionResult<()> {
        let max = self.config.max_concurrent_sessions;
        let timeout = self.config.store_timeout;

        let active = with_timeout(
            timeout,
            "count_active_for_user",
            self.records.count_active_for_user(user_id),
        )
        .await?;

        if active < u64::from(max) {
            debug!(user_id = %user_id, active, max, "Session admitted");
            return Ok(());
        }

        let live = self.live_sessions(user_id).await?;
        if (live.len() as u64) < u64::from(max) {
            info!(
                user_id = %user_id,
                recorded = active,
                live = live.len(),
                "Session admitted; some ACTIVE rows have no ephemeral entry"
            );
            return Ok(());
        }

        let oldest = live.into_iter().next();
        info!(
            user_id = %user_id,
            active,
            max,
            oldest = oldest.as_ref().map(|m| m.session_id.as_str()),
            "Session admission rejected"
        );

        Err(SessionError::CapacityExceeded {
            user_id,
            active,
            max,
            oldest: oldest.map(Box::new),
        })
    }

    /// ACTIVE rows that still have an ephemeral entry, oldest first
    async fn live_sessions(&self, user_id: Uuid) -> SessionResult<Vec<SessionMetadata>> {
        let timeout = self.config.store_timeout;
        let rows = with_timeout(
            timeout,
            "find_active_for_user",
            self.records.find_active_for_user(user_id),
        )
        .await?;

        let mut live = Vec::with_capacity(rows.len());
        for row in rows {
            match with_timeout(timeout, "exists", self.ephemeral.exists(&row.session_id)).await {
                Ok(true) => live.push(row),
                Ok(false) => {
                    debug!(session_id = %row.session_id, "ACTIVE row has no ephemeral entry")
                }
                Err(e) => {
                    // Unknown state counts against the limit
                    warn!(session_id = %row.session_id, "Ephemeral lookup failed: {}", e);
                    live.push(row);
                }
            }
        }

        Ok(live)
    }

    /// Get the limiter configuration
    pub fn config(&self) -> &SessionLimiterConfig {
        &self.config
    }
}
