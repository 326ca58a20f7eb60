//! Reconciliation passes between the ephemeral and durable session stores
//!
//! Each pass is idempotent: it only ever moves ACTIVE rows to a terminal
//! status, deletes long-terminal rows, or records a live session that has no
//! row at all, so running it again, or running it next to the other passes,
//! repeats no transition. Failures on one row are
//! logged and counted, and the pass moves on; a failing batch query aborts
//! only the current run. The next trigger is the retry.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::ReconcilerConfig;
use crate::error::{SessionError, SessionResult};
use crate::models::{EndReason, Session, SessionMetadata, SessionWindow, Transition};
use crate::store::{EphemeralSessionStore, SessionRecordStore, with_timeout};

/// One of the four reconciliation passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    /// End sessions whose ephemeral entry is past its expiry, then drop the entry
    ExpirySweep,
    /// End sessions with no recorded activity inside the inactivity window
    InactivitySweep,
    /// Delete terminal rows past the retention window
    Archival,
    /// End recent ACTIVE rows whose ephemeral entry is already gone
    CrossStoreSync,
}

impl Pass {
    pub const ALL: [Pass; 4] = [
        Pass::ExpirySweep,
        Pass::InactivitySweep,
        Pass::Archival,
        Pass::CrossStoreSync,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Pass::ExpirySweep => "expiry_sweep",
            Pass::InactivitySweep => "inactivity_sweep",
            Pass::Archival => "archival",
            Pass::CrossStoreSync => "cross_store_sync",
        }
    }

    fn index(&self) -> usize {
        match self {
            Pass::ExpirySweep => 0,
            Pass::InactivitySweep => 1,
            Pass::Archival => 2,
            Pass::CrossStoreSync => 3,
        }
    }
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Pass {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pass::ALL
            .into_iter()
            .find(|pass| pass.name() == s)
            .ok_or_else(|| SessionError::InvalidInput(format!("unknown reconciliation pass: {}", s)))
    }
}

/// Counters for one completed pass
///
/// `examined` counts rows matching the pass predicate, `transitioned` rows
/// moved to a terminal status (or deleted, for archival), `skipped` rows that
/// needed no write, and `failed` rows or entries on which any store call
/// failed. `backfilled` counts ACTIVE rows inserted for live entries that had
/// none (cross-store sync only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub pass: Pass,
    pub examined: u64,
    pub transitioned: u64,
    pub skipped: u64,
    pub failed: u64,
    pub backfilled: u64,
}

impl PassReport {
    fn new(pass: Pass) -> Self {
        Self {
            pass,
            examined: 0,
            transitioned: 0,
            skipped: 0,
            failed: 0,
            backfilled: 0,
        }
    }

    fn record(&mut self, transition: Transition) {
        match transition {
            Transition::Ended => self.transitioned += 1,
            Transition::AlreadyTerminal | Transition::Missing => self.skipped += 1,
        }
    }
}

/// Result of triggering a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed(PassReport),
    /// The same pass was still running
    Skipped,
    /// The batch query failed; nothing was written
    Aborted(String),
}

/// Held while a pass runs; releases the pass on drop
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs the reconciliation passes
#[derive(Clone)]
pub struct Reconciler {
    ephemeral: Arc<dyn EphemeralSessionStore>,
    records: Arc<dyn SessionRecordStore>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    running: Arc<[AtomicBool; 4]>,
}

impl Reconciler {
    pub fn new(
        ephemeral: Arc<dyn EphemeralSessionStore>,
        records: Arc<dyn SessionRecordStore>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            ephemeral,
            records,
            clock,
            config,
            running: Arc::new(Default::default()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Whether `pass` is currently running
    pub fn is_running(&self, pass: Pass) -> bool {
        self.running[pass.index()].load(Ordering::Acquire)
    }

    /// Run one pass unless it is already running
    pub async fn run(&self, pass: Pass) -> PassOutcome {
        let Some(_guard) = RunGuard::try_acquire(&self.running[pass.index()]) else {
            warn!(pass = %pass, "Reconciliation pass still running, skipping trigger");
            return PassOutcome::Skipped;
        };

        info!(pass = %pass, "Reconciliation pass started");
        let started = Instant::now();

        let result = match pass {
            Pass::ExpirySweep => self.expiry_sweep().await,
            Pass::InactivitySweep => self.inactivity_sweep().await,
            Pass::Archival => self.archival().await,
            Pass::CrossStoreSync => self.cross_store_sync().await,
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(report) => {
                info!(
                    pass = %pass,
                    examined = report.examined,
                    transitioned = report.transitioned,
                    skipped = report.skipped,
                    failed = report.failed,
                    backfilled = report.backfilled,
                    elapsed_ms,
                    "Reconciliation pass finished"
                );
                PassOutcome::Completed(report)
            }
            Err(e) => {
                error!(pass = %pass, elapsed_ms, "Reconciliation pass aborted: {}", e);
                PassOutcome::Aborted(e.to_string())
            }
        }
    }

    pub async fn run_expiry_sweep(&self) -> PassOutcome {
        self.run(Pass::ExpirySweep).await
    }

    pub async fn run_inactivity_sweep(&self) -> PassOutcome {
        self.run(Pass::InactivitySweep).await
    }

    pub async fn run_archival(&self) -> PassOutcome {
        self.run(Pass::Archival).await
    }

    pub async fn run_cross_store_sync(&self) -> PassOutcome {
        self.run(Pass::CrossStoreSync).await
    }

    async fn call<T, F>(&self, operation: &'static str, call: F) -> SessionResult<T>
    where
        F: Future<Output = SessionResult<T>>,
    {
        with_timeout(self.config.store_timeout(), operation, call).await
    }

    /// Every physically present entry, under the longer scan timeout
    async fn scan(&self) -> SessionResult<Vec<Session>> {
        with_timeout(self.config.scan_timeout(), "list_all", self.ephemeral.list_all()).await
    }

    /// End one row, folding the outcome into the report
    ///
    /// Returns false when the row could not be processed.
    async fn end_row(&self, report: &mut PassReport, session_id: &str, reason: EndReason) -> bool {
        let ended_at = self.clock.now();
        match self
            .call("end_session", self.records.end_session(session_id, reason, ended_at))
            .await
        {
            Ok(transition) => {
                debug!(
                    pass = %report.pass,
                    session_id = %session_id,
                    ?transition,
                    "Processed session"
                );
                report.record(transition);
                true
            }
            Err(e) if e.is_not_found() => {
                report.skipped += 1;
                true
            }
            Err(e) => {
                report.failed += 1;
                error!(
                    pass = %report.pass,
                    session_id = %session_id,
                    "Failed to end session: {}", e
                );
                false
            }
        }
    }

    /// Pass A: every listed entry past its expiry is ended as EXPIRED and removed
    async fn expiry_sweep(&self) -> SessionResult<PassReport> {
        let mut report = PassReport::new(Pass::ExpirySweep);
        let entries = self.scan().await?;
        let now = self.clock.now();

        for session in entries.iter().filter(|s| s.is_expired_at(now)) {
            report.examined += 1;

            // Keep the entry when the row write failed so the next run sees it again
            if !self
                .end_row(&mut report, &session.session_id, EndReason::Expired)
                .await
            {
                continue;
            }

            match self
                .call("delete", self.ephemeral.delete(&session.session_id))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    report.failed += 1;
                    error!(
                        session_id = %session.session_id,
                        "Failed to delete expired session entry: {}", e
                    );
                }
            }
        }

        Ok(report)
    }

    /// Pass B: ACTIVE rows idle past the threshold are ended as INACTIVE
    async fn inactivity_sweep(&self) -> SessionResult<PassReport> {
        let mut report = PassReport::new(Pass::InactivitySweep);
        let threshold = self.clock.now() - self.config.inactivity_threshold();
        let rows = self
            .call("find_inactive_since", self.records.find_inactive_since(threshold))
            .await?;

        for row in rows {
            report.examined += 1;

            if !self
                .end_row(&mut report, &row.session_id, EndReason::Inactive)
                .await
            {
                continue;
            }

            if let Err(e) = self.call("delete", self.ephemeral.delete(&row.session_id)).await {
                warn!(
                    session_id = %row.session_id,
                    "Failed to delete inactive session entry: {}", e
                );
            }
        }

        Ok(report)
    }

    /// Pass C: terminal rows ended before the retention threshold are deleted
    async fn archival(&self) -> SessionResult<PassReport> {
        let mut report = PassReport::new(Pass::Archival);
        let threshold = self.clock.now() - self.config.retention();

        let deleted = self
            .call("delete_ended_before", self.records.delete_ended_before(threshold))
            .await?;

        report.examined = deleted;
        report.transitioned = deleted;
        info!(threshold = %threshold, deleted, "Archived ended sessions");
        Ok(report)
    }

    /// Pass D: reconcile recent ACTIVE rows with the live entries
    ///
    /// Rows whose entry is gone are ended as EXPIRED_IN_REDIS. Live entries
    /// with no row at all (the durable write failed at creation) get an
    /// ACTIVE row backfilled. Never writes to the ephemeral store.
    async fn cross_store_sync(&self) -> SessionResult<PassReport> {
        let mut report = PassReport::new(Pass::CrossStoreSync);
        let now = self.clock.now();
        let window = SessionWindow::new(now - self.config.sync_window(), now)?;

        let rows = self
            .call("find_active_in_window", self.records.find_active_in_window(window))
            .await?;
        let entries = self.scan().await?;

        for row in rows.iter().filter(|row| row.is_active()) {
            report.examined += 1;

            match self.call("exists", self.ephemeral.exists(&row.session_id)).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(session_id = %row.session_id, "ACTIVE row has no ephemeral entry");
                    self.end_row(&mut report, &row.session_id, EndReason::ExpiredInRedis)
                        .await;
                }
                Err(e) => {
                    report.failed += 1;
                    error!(
                        session_id = %row.session_id,
                        "Failed to check ephemeral entry: {}", e
                    );
                }
            }
        }

        let recorded: HashSet<&str> = rows.iter().map(|row| row.session_id.as_str()).collect();
        for session in entries
            .iter()
            .filter(|s| !s.is_expired_at(now) && !recorded.contains(s.session_id.as_str()))
        {
            self.backfill_row(&mut report, session).await;
        }

        Ok(report)
    }

    /// Insert an ACTIVE row for a live entry unless one already exists
    async fn backfill_row(&self, report: &mut PassReport, session: &Session) {
        match self
            .call(
                "find_by_session_id",
                self.records.find_by_session_id(&session.session_id),
            )
            .await
        {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                report.failed += 1;
                error!(session_id = %session.session_id, "Failed to look up session row: {}", e);
                return;
            }
        }

        let mut metadata = SessionMetadata::new_active(
            session.session_id.clone(),
            session.user_id,
            session.device.clone(),
            None,
            None,
            session.created_at,
        );
        metadata.last_activity_at = session.last_access_at;

        match self.call("create", self.records.create(&metadata)).await {
            Ok(()) => {
                report.backfilled += 1;
                info!(
                    session_id = %session.session_id,
                    user_id = %session.user_id,
                    "Backfilled missing session row"
                );
            }
            // Created concurrently
            Err(SessionError::Conflict(_)) => {}
            Err(e) => {
                report.failed += 1;
                error!(session_id = %session.session_id, "Failed to backfill session row: {}", e);
            }
        }
    }
}
