//! Durable session metadata store backed by PostgreSQL

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult};
use crate::models::{DeviceInfo, EndReason, SessionMetadata, SessionWindow, Transition};

/// Relational store of one metadata row per session
#[async_trait]
pub trait SessionRecordStore: Send + Sync {
    /// Insert a new row; `Conflict` if the session id already exists
    async fn create(&self, metadata: &SessionMetadata) -> SessionResult<()>;

    async fn find_by_session_id(&self, session_id: &str) -> SessionResult<Option<SessionMetadata>>;

    /// ACTIVE rows whose last activity is strictly before `threshold`
    async fn find_inactive_since(&self, threshold: DateTime<Utc>)
    -> SessionResult<Vec<SessionMetadata>>;

    /// ACTIVE rows whose `started_at` falls inside the window
    async fn find_active_in_window(&self, window: SessionWindow)
    -> SessionResult<Vec<SessionMetadata>>;

    /// Move an ACTIVE row to the reason's terminal status
    ///
    /// Terminal and missing rows are reported, never treated as errors.
    async fn end_session(
        &self,
        session_id: &str,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> SessionResult<Transition>;

    /// Hard-delete terminal rows with non-null `ended_at < threshold`
    async fn delete_ended_before(&self, threshold: DateTime<Utc>) -> SessionResult<u64>;

    async fn count_active_for_user(&self, user_id: Uuid) -> SessionResult<u64>;

    /// ACTIVE rows of one user, oldest first
    async fn find_active_for_user(&self, user_id: Uuid) -> SessionResult<Vec<SessionMetadata>>;

    /// Rows of one user started inside the window, newest first
    async fn find_for_user_in_window(
        &self,
        user_id: Uuid,
        window: SessionWindow,
    ) -> SessionResult<Vec<SessionMetadata>>;

    /// Bump `last_activity_at` on an ACTIVE row; false if nothing changed
    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> SessionResult<bool>;

    async fn health_check(&self) -> SessionResult<bool>;
}

const COLUMNS: &str = "session_id, user_id, device_type, device_id, app_version, ip_address, \
                       user_agent, started_at, last_activity_at, status, ended_at, end_reason";

/// PostgreSQL implementation of [`SessionRecordStore`]
#[derive(Clone)]
pub struct PgSessionRecordStore {
    pool: PgPool,
}

impl PgSessionRecordStore {
    /// Create a new session metadata repository
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: &PgRow) -> SessionResult<SessionMetadata> {
        let status: String = row.try_get("status")?;

        Ok(SessionMetadata {
            session_id: row.try_get("session_id")?,
            user_id: row.try_get("user_id")?,
            device: DeviceInfo {
                device_type: row.try_get("device_type")?,
                device_id: row.try_get("device_id")?,
                app_version: row.try_get("app_version")?,
            },
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            started_at: row.try_get("started_at")?,
            last_activity_at: row.try_get("last_activity_at")?,
            status: status.parse()?,
            ended_at: row.try_get("ended_at")?,
            end_reason: row.try_get("end_reason")?,
        })
    }

    fn map_rows(rows: Vec<PgRow>) -> SessionResult<Vec<SessionMetadata>> {
        rows.iter().map(Self::map_row).collect()
    }
}

#[async_trait]
impl SessionRecordStore for PgSessionRecordStore {
    async fn create(&self, metadata: &SessionMetadata) -> SessionResult<()> {
        sqlx::query(
            r#"
            INSERT INTO session_metadata
                (session_id, user_id, device_type, device_id, app_version, ip_address,
                 user_agent, started_at, last_activity_at, status, ended_at, end_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&metadata.session_id)
        .bind(metadata.user_id)
        .bind(&metadata.device.device_type)
        .bind(&metadata.device.device_id)
        .bind(&metadata.device.app_version)
        .bind(&metadata.ip_address)
        .bind(&metadata.user_agent)
        .bind(metadata.started_at)
        .bind(metadata.last_activity_at)
        .bind(metadata.status.as_str())
        .bind(metadata.ended_at)
        .bind(&metadata.end_reason)
        .execute(&self.pool)
        .await
        .map_err(|e| match SessionError::from(e) {
            SessionError::Conflict(_) => SessionError::Conflict(metadata.session_id.clone()),
            other => other,
        })?;

        debug!(session_id = %metadata.session_id, "Created session metadata");
        Ok(())
    }

    async fn find_by_session_id(&self, session_id: &str) -> SessionResult<Option<SessionMetadata>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM session_metadata WHERE session_id = $1",
            COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::map_row).transpose()
    }

    async fn find_inactive_since(
        &self,
        threshold: DateTime<Utc>,
    ) -> SessionResult<Vec<SessionMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM session_metadata \
             WHERE status = 'ACTIVE' AND last_activity_at < $1 \
             ORDER BY last_activity_at",
            COLUMNS
        ))
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        Self::map_rows(rows)
    }

    async fn find_active_in_window(
        &self,
        window: SessionWindow,
    ) -> SessionResult<Vec<SessionMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM session_metadata \
             WHERE status = 'ACTIVE' AND started_at BETWEEN $1 AND $2 \
             ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        Self::map_rows(rows)
    }

    async fn end_session(
        &self,
        session_id: &str,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> SessionResult<Transition> {
        // The status predicate makes the write a no-op on terminal rows
        let result = sqlx::query(
            r#"
            UPDATE session_metadata
            SET status = $2, end_reason = $3, ended_at = $4
            WHERE session_id = $1 AND status = 'ACTIVE'
            "#,
        )
        .bind(session_id)
        .bind(reason.terminal_status().as_str())
        .bind(reason.as_str())
        .bind(ended_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(Transition::Ended);
        }

        let exists: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM session_metadata WHERE session_id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(match exists {
            Some(_) => Transition::AlreadyTerminal,
            None => Transition::Missing,
        })
    }

    async fn delete_ended_before(&self, threshold: DateTime<Utc>) -> SessionResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM session_metadata
            WHERE ended_at IS NOT NULL AND ended_at < $1 AND status <> 'ACTIVE'
            "#,
        )
        .bind(threshold)
        .execute(&self.pool)
        .await?;

        info!(deleted = result.rows_affected(), "Deleted ended session metadata");
        Ok(result.rows_affected())
    }

    async fn count_active_for_user(&self, user_id: Uuid) -> SessionResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM session_metadata WHERE user_id = $1 AND status = 'ACTIVE'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn find_active_for_user(&self, user_id: Uuid) -> SessionResult<Vec<SessionMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM session_metadata \
             WHERE user_id = $1 AND status = 'ACTIVE' \
             ORDER BY started_at ASC",
            COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Self::map_rows(rows)
    }

    async fn find_for_user_in_window(
        &self,
        user_id: Uuid,
        window: SessionWindow,
    ) -> SessionResult<Vec<SessionMetadata>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM session_metadata \
             WHERE user_id = $1 AND started_at BETWEEN $2 AND $3 \
             ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(user_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await?;

        Self::map_rows(rows)
    }

    async fn touch(&self, session_id: &str, at: DateTime<Utc>) -> SessionResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE session_metadata
            SET last_activity_at = $2
            WHERE session_id = $1 AND status = 'ACTIVE' AND last_activity_at < $2
            "#,
        )
        .bind(session_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> SessionResult<bool> {
        Ok(common::database::health_check(&self.pool).await?)
    }
}
